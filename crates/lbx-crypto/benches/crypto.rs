use lbx_crypto::{decrypt, encrypt, encrypt_chunked, EncryptionKey};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn bench_key() -> EncryptionKey {
    EncryptionKey::from_bytes([0xABu8; 32])
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt(bencher: divan::Bencher, size: usize) {
    let key = bench_key();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data), divan::black_box(&key)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt(bencher: divan::Bencher, size: usize) {
    let key = bench_key();
    let data = make_data(size);
    let blob = encrypt(&data, &key).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decrypt(divan::black_box(&blob), divan::black_box(&key)).unwrap());
}

#[divan::bench(args = [4194304, 16777216])]
fn bench_encrypt_chunked_1mib(bencher: divan::Bencher, size: usize) {
    let key = bench_key();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt_chunked(divan::black_box(&data), &key, 1024 * 1024).unwrap());
}

fn main() {
    divan::main();
}
