//! # Crash Recovery Tests
//!
//! These tests simulate a process death between a file mutation and the
//! following commit, then assert the next open rolls the data file back to
//! its last commit point. "Crash" here means dropping the store without
//! `close(true)`: file handles close, but nothing is flushed or marked
//! clean, which is indistinguishable from a kill.
//!
//! ## Requirements Tested
//!
//! - R1: with incremental backup, a row write spanning two shadow pages is
//!   fully reverted by the shadow replay — both pages byte-identical to the
//!   pre-write originals
//! - R2: the header SAVED flag is down on disk between first mutation and
//!   commit, and up after commit
//! - R3: with full backup, an unclean session rolls back to the backup
//!   archive's commit point
//! - R4: uncommitted rows are invisible after recovery; committed rows
//!   survive
//! - R5: `close(false)` behaves exactly like a crash

use std::path::Path;

use rowfile::codec::{CachedObject, RawRow, RawRowCodec};
use rowfile::config::ScaledFileConfig;
use rowfile::storage::DataFileCache;
use tempfile::tempdir;

fn open_with(path: &Path, incremental: bool) -> DataFileCache<RawRowCodec> {
    let config = ScaledFileConfig::builder()
        .scale(8)
        .incremental_backup(incremental)
        .build()
        .unwrap();
    DataFileCache::open(path, config, RawRowCodec::new(8)).unwrap()
}

/// Header flags live in bytes [28, 32); SAVED is bit 2.
fn saved_flag(path: &Path) -> bool {
    let raw = std::fs::read(path).unwrap();
    let flags = u32::from_be_bytes(raw[28..32].try_into().unwrap());
    flags & 0b10 != 0
}

mod shadow_restore {
    use super::*;

    #[test]
    fn two_page_overwrite_reverts_to_pre_write_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        // Commit a row large enough to span two 4096-byte shadow pages.
        let position = {
            let store = open_with(&path, true);
            let row = store.add(RawRow::new(vec![0x11; 6000], 8)).unwrap();
            let position = row.position();
            store.close(true).unwrap();
            position
        };
        let committed_bytes = std::fs::read(&path).unwrap();

        // Overwrite the row in place, forcing the bytes to disk, then die
        // before commit.
        {
            let store = open_with(&path, true);
            let mut replacement = RawRow::new(vec![0x99; 6000], 8);
            replacement.set_position(position);
            store.save_row(&replacement).unwrap();
            assert!(path.with_extension("dat.shadow").exists() || shadow_exists(&path));
            // Crash: no commit, no close.
        }

        // Reopen triggers the shadow replay.
        {
            let store = open_with(&path, true);
            let row = store.get(position, false).unwrap();
            assert_eq!(row.payload(), &vec![0x11; 6000][..]);
            store.close(false).unwrap();
        }

        let restored_bytes = std::fs::read(&path).unwrap();
        assert_eq!(restored_bytes, committed_bytes);
    }

    fn shadow_exists(path: &Path) -> bool {
        let mut name = path.as_os_str().to_os_string();
        name.push(".shadow");
        Path::new(&name).exists()
    }

    #[test]
    fn uncommitted_add_disappears_after_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        let committed_pos = {
            let store = open_with(&path, true);
            let keep = store.add(RawRow::new(b"committed".to_vec(), 8)).unwrap();
            store.commit_changes().unwrap();

            // This one never commits; force its bytes to disk so recovery
            // has something real to undo.
            let doomed = store.add(RawRow::new(b"doomed row".to_vec(), 8)).unwrap();
            store.save_row(&doomed).unwrap();
            keep.position()
            // Crash.
        };

        let store = open_with(&path, true);
        let row = store.get(committed_pos, false).unwrap();
        assert_eq!(row.payload(), b"committed");

        // The end-of-file pointer reverted with the header page, so the
        // doomed row's space is not even allocated any more.
        assert_eq!(store.free_pos(), 32 + 16);
    }

    #[test]
    fn clean_shutdown_leaves_no_shadow_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        let store = open_with(&path, true);
        store.add(RawRow::new(b"row".to_vec(), 8)).unwrap();
        store.close(true).unwrap();

        assert!(!shadow_exists(&path));
        assert!(saved_flag(&path));
    }
}

mod header_flags {
    use super::*;

    #[test]
    fn saved_drops_on_first_mutation_and_returns_on_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let store = open_with(&path, true);

        assert!(saved_flag(&path), "fresh file starts clean");

        store.add(RawRow::new(b"x".to_vec(), 8)).unwrap();
        assert!(!saved_flag(&path), "first mutation marks the file dirty");

        store.commit_changes().unwrap();
        assert!(saved_flag(&path), "commit marks the file clean");

        store.add(RawRow::new(b"y".to_vec(), 8)).unwrap();
        assert!(!saved_flag(&path), "next interval drops the flag again");

        store.close(true).unwrap();
        assert!(saved_flag(&path));
    }
}

mod backup_restore {
    use super::*;

    #[test]
    fn unclean_session_rolls_back_to_backup_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        let committed_pos = {
            let store = open_with(&path, false);
            let keep = store.add(RawRow::new(b"snapshot me".to_vec(), 8)).unwrap();
            store.commit_changes().unwrap();

            let doomed = store.add(RawRow::new(vec![0xEE; 100], 8)).unwrap();
            store.save_row(&doomed).unwrap();
            keep.position()
            // Crash.
        };
        assert!(!saved_flag(&path));

        let store = open_with(&path, false);
        let row = store.get(committed_pos, false).unwrap();
        assert_eq!(row.payload(), b"snapshot me");
        assert_eq!(store.free_pos(), 32 + 16);
    }

    #[test]
    fn close_false_is_equivalent_to_a_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        {
            let store = open_with(&path, false);
            let row = store.add(RawRow::new(b"persisted".to_vec(), 8)).unwrap();
            store.commit_changes().unwrap();

            let mut overwrite = RawRow::new(b"discarded".to_vec(), 8);
            overwrite.set_position(row.position());
            store.save_row(&overwrite).unwrap();
            store.close(false).unwrap();
        }

        let store = open_with(&path, false);
        let row = store.get(4, false).unwrap();
        assert_eq!(row.payload(), b"persisted");
    }

    #[test]
    fn backup_archive_tracks_the_latest_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        {
            let store = open_with(&path, false);
            store.add(RawRow::new(b"first commit".to_vec(), 8)).unwrap();
            store.commit_changes().unwrap();

            let second = store.add(RawRow::new(b"second commit".to_vec(), 8)).unwrap();
            store.commit_changes().unwrap();
            let second_pos = second.position();

            // Mutate, then crash: recovery must land on the *second*
            // commit, not the first.
            let third = store.add(RawRow::new(b"never".to_vec(), 8)).unwrap();
            store.save_row(&third).unwrap();
            drop(store);

            let store = open_with(&path, false);
            let row = store.get(second_pos, false).unwrap();
            assert_eq!(row.payload(), b"second commit");
        }
    }
}
