use murk_transform::encryption::{byte_literal, KeyTable, StringEncryptor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn decrypt_inverts_encrypt_for_random_payloads() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for _ in 0..64 {
        let len = rng.random_range(0..200);
        let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let key_len = rng.random_range(1..64);
        let table = KeyTable::generate(key_len, &mut rng);

        let cipher = table.encrypt(&payload);
        assert_eq!(cipher.len(), payload.len());
        assert_eq!(table.decrypt(&cipher), payload);
    }
}

#[test]
fn identical_literals_get_fresh_keys() {
    let mut rng = StdRng::seed_from_u64(1);
    let encryptor = StringEncryptor::new("__d");
    let a = encryptor.encrypt(b"password", &mut rng);
    let b = encryptor.encrypt(b"password", &mut rng);

    assert_ne!(a.key, b.key);
    assert!(a.expression.starts_with("__d("));
    assert!(a.expression.contains(&byte_literal(&a.cipher)));
    assert!(a.expression.contains(&byte_literal(&a.key)));
}

#[test]
fn encrypted_string_reports_hex() {
    let table = KeyTable::from_bytes([0xFFu8]).unwrap();
    let encrypted = StringEncryptor::default().encrypt_with(b"\x0F", &table);
    let json = serde_json::to_value(&encrypted).unwrap();

    assert_eq!(json["key"], "ff");
    assert_eq!(json["cipher"], "f0");
    assert_eq!(json["expression"], r#"decrypt("\240", "\255", 1)"#);
}
