//! Threshold sharing of 32-byte keys over GF(256)
//!
//! Each byte of the secret is the constant term of its own random polynomial
//! of degree `k - 1`. Share `x` holds every polynomial evaluated at `x`, so a
//! share is `{index: x, secret: [p_0(x), ..., p_31(x)]}`. Any `k` shares
//! determine the polynomials (Lagrange interpolation at 0); `k - 1` shares
//! are consistent with every possible secret.

use rand::RngCore;
use std::collections::HashSet;
use zeroize::{Zeroize, Zeroizing};

use tessera_core::{HolderType, TesseraError, TesseraResult, KEY_SIZE};

/// Largest `n` (x-coordinates are the nonzero elements of GF(256))
pub const MAX_SHARES: usize = 255;

/// Smallest meaningful threshold
pub const MIN_THRESHOLD: usize = 2;

/// GF(256) arithmetic with the AES reduction polynomial x^8 + x^4 + x^3 + x + 1.
mod gf256 {
    /// Russian-peasant multiply, reducing by 0x11B after each doubling.
    pub const fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut result: u8 = 0;
        let mut i = 0;
        while i < 8 {
            if b & 1 != 0 {
                result ^= a;
            }
            let carry = a & 0x80;
            a <<= 1;
            if carry != 0 {
                a ^= 0x1B;
            }
            b >>= 1;
            i += 1;
        }
        result
    }

    /// a^254 == a^-1 for nonzero a. Returns 0 for 0.
    pub const fn inv(a: u8) -> u8 {
        if a == 0 {
            return 0;
        }
        let mut result = 1u8;
        let mut base = a;
        let mut exp = 254u8;
        while exp > 0 {
            if exp & 1 != 0 {
                result = mul(result, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        result
    }

    /// Horner evaluation; `coeffs[0]` is the constant term.
    pub fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
        coeffs
            .iter()
            .rev()
            .fold(0u8, |acc, &coeff| mul(acc, x) ^ coeff)
    }

    /// Lagrange basis values `L_j(at)` for the points `xs`.
    ///
    /// Subtraction is XOR in GF(2^8). Callers guarantee distinct nonzero `xs`.
    pub fn lagrange_basis(xs: &[u8], at: u8) -> Vec<u8> {
        xs.iter()
            .enumerate()
            .map(|(j, &xj)| {
                let mut num = 1u8;
                let mut den = 1u8;
                for (m, &xm) in xs.iter().enumerate() {
                    if m == j {
                        continue;
                    }
                    num = mul(num, at ^ xm);
                    den = mul(den, xj ^ xm);
                }
                mul(num, inv(den))
            })
            .collect()
    }
}

/// One threshold share of a 32-byte key.
///
/// `secret` is a `Vec` rather than an array because shares come back from
/// storage and are validated on recombination. Zeroized on drop.
#[derive(Clone)]
pub struct KeyShare {
    /// x-coordinate, 1..=255
    pub index: u8,
    /// y-coordinates, one per secret byte
    pub secret: Vec<u8>,
    pub holder: HolderType,
}

impl Drop for KeyShare {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl KeyShare {
    pub fn new(index: u8, secret: Vec<u8>, holder: HolderType) -> Self {
        Self {
            index,
            secret,
            holder,
        }
    }
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index)
            .field("holder", &self.holder)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn check_params(n: usize, k: usize) -> TesseraResult<()> {
    if k < MIN_THRESHOLD || k > n || n > MAX_SHARES {
        return Err(TesseraError::validation(format!(
            "share parameters must satisfy 2 <= k ({k}) <= n ({n}) <= {MAX_SHARES}"
        )));
    }
    Ok(())
}

/// Split `secret` into `n` shares, any `k` of which recombine it.
///
/// Shares get x-coordinates `1..=n` and holder type `Server`; the caller
/// re-labels the ones it hands to the user.
pub fn split(secret: &[u8; KEY_SIZE], n: usize, k: usize) -> TesseraResult<Vec<KeyShare>> {
    check_params(n, k)?;

    let mut shares: Vec<KeyShare> = (1..=n)
        .map(|x| KeyShare::new(x as u8, vec![0u8; KEY_SIZE], HolderType::Server))
        .collect();

    let mut coeffs = Zeroizing::new(vec![0u8; k]);
    let mut rng = rand::thread_rng();

    for (byte_idx, &secret_byte) in secret.iter().enumerate() {
        coeffs[0] = secret_byte;
        rng.fill_bytes(&mut coeffs[1..]);

        for share in &mut shares {
            share.secret[byte_idx] = gf256::eval_poly(&coeffs, share.index);
        }
    }

    Ok(shares)
}

/// Recombine a key from at least `k` shares.
///
/// The first `k` shares (by index) are interpolated at 0. Any extra shares
/// must lie on the same polynomials; otherwise the set is inconsistent and
/// `RecombinationFailure` is returned instead of a wrong key.
pub fn recombine(shares: &[KeyShare], k: usize) -> TesseraResult<Zeroizing<[u8; KEY_SIZE]>> {
    if k < MIN_THRESHOLD || k > MAX_SHARES {
        return Err(TesseraError::validation(format!(
            "threshold must be between {MIN_THRESHOLD} and {MAX_SHARES}, got {k}"
        )));
    }
    if shares.len() < k {
        return Err(TesseraError::InsufficientShares {
            have: shares.len(),
            need: k,
        });
    }

    let mut seen = HashSet::with_capacity(shares.len());
    for share in shares {
        if share.index == 0 {
            return Err(TesseraError::InvalidShare(
                "share index 0 is not a valid x-coordinate".into(),
            ));
        }
        if share.secret.len() != KEY_SIZE {
            return Err(TesseraError::InvalidShare(format!(
                "share {} has {} secret bytes (expected {KEY_SIZE})",
                share.index,
                share.secret.len()
            )));
        }
        if !seen.insert(share.index) {
            return Err(TesseraError::InvalidShare(format!(
                "duplicate share index {}",
                share.index
            )));
        }
    }

    let mut ordered: Vec<&KeyShare> = shares.iter().collect();
    ordered.sort_by_key(|s| s.index);
    let (basis_shares, extra) = ordered.split_at(k);

    let xs: Vec<u8> = basis_shares.iter().map(|s| s.index).collect();
    let at_zero = gf256::lagrange_basis(&xs, 0);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    for (byte_idx, key_byte) in key.iter_mut().enumerate() {
        *key_byte = basis_shares
            .iter()
            .zip(&at_zero)
            .fold(0u8, |acc, (s, &l)| acc ^ gf256::mul(s.secret[byte_idx], l));
    }

    for share in extra {
        let at_x = gf256::lagrange_basis(&xs, share.index);
        for byte_idx in 0..KEY_SIZE {
            let expected = basis_shares
                .iter()
                .zip(&at_x)
                .fold(0u8, |acc, (s, &l)| acc ^ gf256::mul(s.secret[byte_idx], l));
            if expected != share.secret[byte_idx] {
                return Err(TesseraError::RecombinationFailure(format!(
                    "share {} is inconsistent with shares {:?}",
                    share.index, xs
                )));
            }
        }
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_secret() -> [u8; KEY_SIZE] {
        let mut s = [0u8; KEY_SIZE];
        for (i, b) in s.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37) ^ 0x5A;
        }
        s
    }

    fn pick(shares: &[KeyShare], indices: &[u8]) -> Vec<KeyShare> {
        shares
            .iter()
            .filter(|s| indices.contains(&s.index))
            .cloned()
            .collect()
    }

    #[test]
    fn gf256_inverse_exhaustive() {
        for a in 1..=255u8 {
            assert_eq!(gf256::mul(a, gf256::inv(a)), 1, "a={a}");
        }
        assert_eq!(gf256::inv(0), 0);
    }

    #[test]
    fn gf256_mul_commutes() {
        for a in [0u8, 1, 2, 0x53, 0xCA, 0xFF] {
            for b in [0u8, 1, 3, 0x80, 0xFE] {
                assert_eq!(gf256::mul(a, b), gf256::mul(b, a));
            }
        }
        // Known AES field product
        assert_eq!(gf256::mul(0x53, 0xCA), 0x01);
    }

    #[test]
    fn split_five_of_three_recombines_from_odd_indices() {
        let secret = test_secret();
        let shares = split(&secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let key = recombine(&pick(&shares, &[1, 3, 5]), 3).unwrap();
        assert_eq!(*key, secret);
    }

    #[test]
    fn two_of_three_is_insufficient() {
        let shares = split(&test_secret(), 5, 3).unwrap();
        let err = recombine(&pick(&shares, &[1, 2]), 3).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::InsufficientShares { have: 2, need: 3 }
        ));
    }

    #[test]
    fn shares_have_distinct_indices_and_server_holder() {
        let shares = split(&test_secret(), 10, 4).unwrap();
        let idx: HashSet<u8> = shares.iter().map(|s| s.index).collect();
        assert_eq!(idx.len(), 10);
        assert!(shares.iter().all(|s| s.index >= 1));
        assert!(shares.iter().all(|s| s.holder == HolderType::Server));
        assert!(shares.iter().all(|s| s.secret.len() == KEY_SIZE));
    }

    #[test]
    fn all_shares_recombine() {
        let secret = test_secret();
        let shares = split(&secret, 7, 4).unwrap();
        assert_eq!(*recombine(&shares, 4).unwrap(), secret);
    }

    #[test]
    fn max_parameters() {
        let secret = test_secret();
        let shares = split(&secret, 255, 255).unwrap();
        assert_eq!(shares.len(), 255);
        assert_eq!(shares.last().unwrap().index, 255);
        assert_eq!(*recombine(&shares, 255).unwrap(), secret);
    }

    #[test]
    fn invalid_parameters_rejected() {
        let s = test_secret();
        assert!(matches!(split(&s, 5, 1), Err(TesseraError::Validation(_))));
        assert!(matches!(split(&s, 3, 4), Err(TesseraError::Validation(_))));
        assert!(matches!(split(&s, 256, 3), Err(TesseraError::Validation(_))));
    }

    #[test]
    fn duplicate_index_rejected() {
        let shares = split(&test_secret(), 5, 3).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        assert!(matches!(
            recombine(&dup, 3),
            Err(TesseraError::InvalidShare(_))
        ));
    }

    #[test]
    fn wrong_secret_length_rejected() {
        let mut shares = split(&test_secret(), 5, 3).unwrap();
        shares[1].secret.truncate(31);
        assert!(matches!(
            recombine(&shares[..3], 3),
            Err(TesseraError::InvalidShare(_))
        ));
    }

    #[test]
    fn zero_index_rejected() {
        let mut shares = split(&test_secret(), 5, 3).unwrap();
        shares[2].index = 0;
        assert!(matches!(
            recombine(&shares[..3], 3),
            Err(TesseraError::InvalidShare(_))
        ));
    }

    #[test]
    fn inconsistent_extra_share_detected() {
        let mut shares = split(&test_secret(), 5, 3).unwrap();
        shares[4].secret[7] ^= 0x01;
        assert!(matches!(
            recombine(&shares, 3),
            Err(TesseraError::RecombinationFailure(_))
        ));
    }

    #[test]
    fn shares_from_different_splits_are_inconsistent() {
        let a = split(&test_secret(), 4, 2).unwrap();
        let b = split(&test_secret(), 4, 2).unwrap();
        let mixed = vec![a[0].clone(), a[1].clone(), b[2].clone()];
        assert!(matches!(
            recombine(&mixed, 2),
            Err(TesseraError::RecombinationFailure(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let shares = split(&test_secret(), 3, 2).unwrap();
        let dbg = format!("{:?}", shares[0]);
        assert!(dbg.contains("REDACTED"));
    }

    proptest! {
        #[test]
        fn any_k_subset_recombines(
            secret in proptest::array::uniform32(any::<u8>()),
            n in 2usize..=12,
            k_seed in any::<u8>(),
            pick_seed in any::<u64>(),
        ) {
            let k = 2 + (k_seed as usize) % (n - 1);
            let shares = split(&secret, n, k).unwrap();

            // Deterministic shuffle from the seed, then take k.
            let mut order: Vec<usize> = (0..n).collect();
            let mut state = pick_seed | 1;
            for i in (1..n).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                order.swap(i, (state % (i as u64 + 1)) as usize);
            }
            let subset: Vec<KeyShare> = order[..k].iter().map(|&i| shares[i].clone()).collect();

            let key = recombine(&subset, k).unwrap();
            prop_assert_eq!(*key, secret);
        }

        #[test]
        fn k_minus_one_is_insufficient(
            secret in proptest::array::uniform32(any::<u8>()),
            n in 2usize..=12,
        ) {
            let k = n;
            let shares = split(&secret, n, k).unwrap();
            let err = recombine(&shares[1..], k).unwrap_err();
            let is_insufficient = matches!(err, TesseraError::InsufficientShares { .. });
            prop_assert!(is_insufficient);
        }
    }
}
