//! Checksum coverage: every stored byte is protected, scans classify
//! corruption correctly, and anticipated-error probes never poison the
//! environment.

mod common;

use std::fs;
use std::io::Write;

use proptest::prelude::*;

use umbra_cleaner::error::EngineError;
use umbra_cleaner::log::reader::{find_end_of_log, FileReader, ValidationMode};
use umbra_cleaner::log::{
    LnEntry, LogEntryType, HEADER_BYTES, HEADER_SIZE_OFFSET, HEADER_TYPE_OFFSET,
};
use umbra_cleaner::DatabaseId;

use common::{create_env, test_config};

const DB: DatabaseId = DatabaseId(1);

fn flip_byte(path: &std::path::Path, offset: u64, xor: u8) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset as usize] ^= xor;
    fs::write(path, bytes).unwrap();
}

#[test]
fn random_reads_roundtrip_and_validate() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    let lsn = env.put(DB, b"alpha", b"some value bytes").unwrap();

    let (header, entry_type, payload) = env.file_manager().read_entry(lsn).unwrap();
    assert_eq!(entry_type, LogEntryType::Ln);
    assert_eq!(header.size as usize, payload.len());
    let decoded = LnEntry::decode(&payload).unwrap();
    assert_eq!(decoded.key, b"alpha");
    assert_eq!(decoded.value, b"some value bytes");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // Payload of `put(DB, "victim", "payload-bytes")`:
    // db(4) + node(8) + flags(1) + klen(2) + key(6) + vlen(4) + value(13).
    #[test]
    fn any_corrupted_payload_byte_fails_the_scan(byte_index in 0usize..38, xor in 1u8..) {
        let (_dir, env) = create_env(test_config());
        env.register_db(DB);
        let lsn = env.put(DB, b"victim", b"payload-bytes").unwrap();
        let path = env.file_manager().file_path(0);
        flip_byte(&path, u64::from(lsn.offset()) + HEADER_BYTES as u64 + byte_index as u64, xor);

        let mut reader = FileReader::new(
            env.file_manager(),
            0,
            8192,
            ValidationMode::Always,
            false,
        ).unwrap();
        // The file header entry is intact.
        prop_assert!(reader.next_entry().unwrap().is_some());
        let err = reader.next_entry().unwrap_err();
        prop_assert!(
            matches!(err, EngineError::ChecksumMismatch { .. }),
            "expected checksum mismatch, got {:?}",
            err
        );
        prop_assert!(env.state().check_if_invalid().is_err());
    }
}

#[test]
fn unknown_type_tag_is_a_checksum_class_error() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    let lsn = env.put(DB, b"victim", b"value").unwrap();
    let path = env.file_manager().file_path(0);
    // Patch the type tag to an unregistered value.
    let mut bytes = fs::read(&path).unwrap();
    bytes[lsn.offset() as usize + HEADER_TYPE_OFFSET] = 0xEE;
    fs::write(&path, bytes).unwrap();

    let mut reader =
        FileReader::new(env.file_manager(), 0, 8192, ValidationMode::Always, false).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    let err = reader.next_entry().unwrap_err();
    assert!(matches!(err, EngineError::InvalidEntryType { tag: 0xEE, .. }));
    assert!(err.is_checksum_class());
}

#[test]
fn end_of_log_probe_stops_at_corruption_without_invalidating() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    env.put(DB, b"one", b"1").unwrap();
    env.put(DB, b"two", b"2").unwrap();
    let last = env.put(DB, b"three", b"3").unwrap();
    let path = env.file_manager().file_path(0);
    flip_byte(&path, u64::from(last.offset()) + HEADER_BYTES as u64 + 1, 0x40);

    let end = find_end_of_log(env.file_manager(), 0, 8192).unwrap();
    assert_eq!(end, last.offset());

    // Anticipated failures never poison the environment.
    env.state().check_if_invalid().unwrap();
    env.put(DB, b"four", b"4").unwrap();
}

#[test]
fn end_of_log_probe_ignores_a_garbage_tail() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    let last = env.put(DB, b"solo", b"value").unwrap();
    let end_of_valid = last.offset() + (HEADER_BYTES + last_payload_len(&env, last)) as u32;

    let path = env.file_manager().file_path(0);
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB; 5]).unwrap();
    file.sync_all().unwrap();

    assert_eq!(find_end_of_log(env.file_manager(), 0, 8192).unwrap(), end_of_valid);
    env.state().check_if_invalid().unwrap();
}

#[test]
fn end_of_log_probe_rejects_an_oversized_tail_header() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    let last = env.put(DB, b"solo", b"value").unwrap();
    let end_of_valid = last.offset() + (HEADER_BYTES + last_payload_len(&env, last)) as u32;

    // A torn tail that happens to decode as a registered type tag with an
    // absurd payload size. The size must be bounded by the bytes actually
    // in the file, not trusted.
    let mut forged = [0u8; HEADER_BYTES];
    forged[HEADER_TYPE_OFFSET] = LogEntryType::Ln.tag();
    forged[HEADER_SIZE_OFFSET..].copy_from_slice(&0xFFFF_FF00u32.to_be_bytes());
    let path = env.file_manager().file_path(0);
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&forged).unwrap();
    file.sync_all().unwrap();

    assert_eq!(find_end_of_log(env.file_manager(), 0, 8192).unwrap(), end_of_valid);
    env.state().check_if_invalid().unwrap();

    // A strict scan classifies the same tail as corruption.
    let mut strict =
        FileReader::new(env.file_manager(), 0, 8192, ValidationMode::Always, false).unwrap();
    strict.next_entry().unwrap();
    strict.next_entry().unwrap();
    let err = strict.next_entry().unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)));
}

fn last_payload_len(env: &umbra_cleaner::Environment, lsn: umbra_cleaner::Lsn) -> usize {
    let (_, _, payload) = env.file_manager().read_entry(lsn).unwrap();
    payload.len()
}

#[test]
fn target_only_validation_skips_other_types() {
    let (_dir, env) = create_env(test_config());
    env.register_db(DB);
    env.put(DB, b"a", b"1").unwrap();
    let mid = env.put(DB, b"b", b"2").unwrap();
    env.put(DB, b"c", b"3").unwrap();
    let path = env.file_manager().file_path(0);
    flip_byte(&path, u64::from(mid.offset()) + HEADER_BYTES as u64 + 3, 0x01);

    // Only Root entries are validated, so the damaged Ln scans through.
    let mut reader = FileReader::new(
        env.file_manager(),
        0,
        8192,
        ValidationMode::TargetOnly(LogEntryType::Root),
        false,
    )
    .unwrap();
    let mut count = 0;
    while reader.next_entry().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 4); // file header + three records
    env.state().check_if_invalid().unwrap();

    // The same file fails a full-validation scan.
    let mut strict =
        FileReader::new(env.file_manager(), 0, 8192, ValidationMode::Always, false).unwrap();
    strict.next_entry().unwrap();
    strict.next_entry().unwrap();
    assert!(strict.next_entry().is_err());
}
