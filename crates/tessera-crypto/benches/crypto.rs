use tessera_core::CipherSuite;
use tessera_crypto::{decrypt, encrypt, recombine, split};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_aes(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data), 5, 3, CipherSuite::Aes256Gcm).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_twofish(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data), 5, 3, CipherSuite::TwofishGcm).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_xchacha(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let enc = encrypt(&data, 5, 3, CipherSuite::XChaCha20Poly1305).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            decrypt(
                divan::black_box(&enc.ciphertext),
                &enc.iv,
                &enc.shares[..3],
                3,
                &enc.salt,
                enc.suite,
            )
            .unwrap()
        });
}

#[divan::bench(args = [3, 16, 255])]
fn bench_split_recombine(n: usize) {
    let secret = [0x5Au8; 32];
    let k = n.max(2) / 2 + 1;
    let shares = split(divan::black_box(&secret), n, k).unwrap();
    recombine(&shares[..k], k).unwrap();
}

fn main() {
    divan::main();
}
