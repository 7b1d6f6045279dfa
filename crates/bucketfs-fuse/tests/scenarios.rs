//! End-to-end scenarios driven against the in-memory fake store.
//!
//! These tests exercise the dispatcher core the way the kernel bridge
//! does: lookups, directory listings, reads, writes, flushes and releases,
//! with the fake store standing in for the remote bucket.

use std::sync::Arc;
use std::time::Duration;

use bucketfs_core::config::Config;
use bucketfs_core::ports::object_store::ObjectStore;
use bucketfs_fuse::core::xattr;
use bucketfs_fuse::{FsCore, FsError};
use bucketfs_store::FakeObjectStore;
use fuser::FileType;

const ROOT: u64 = 1;

struct Fixture {
    core: FsCore,
    fake: Arc<FakeObjectStore>,
    _dirs: Vec<tempfile::TempDir>,
}

fn fixture(tweak: impl FnOnce(&mut Config)) -> Fixture {
    let cache_dir = tempfile::tempdir().unwrap();
    let scratch_dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.store.bucket = "test-bucket".to_string();
    config.store.anonymous_access = true;
    config.file_cache.dir = cache_dir.path().to_path_buf();
    config.write.scratch_dir = scratch_dir.path().to_path_buf();
    tweak(&mut config);

    let fake = Arc::new(FakeObjectStore::new());
    let core = FsCore::new(config, Arc::clone(&fake) as Arc<dyn ObjectStore>).unwrap();
    Fixture {
        core,
        fake,
        _dirs: vec![cache_dir, scratch_dir],
    }
}

/// Reads a whole file through an open handle in fixed-size requests.
async fn read_all(core: &FsCore, fh: u64, size: u64, step: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while offset < size {
        let data = core.read_file(fh, offset, step).await.unwrap();
        assert!(!data.is_empty(), "short read at {offset}");
        offset += data.len() as u64;
        out.extend_from_slice(&data);
    }
    out
}

/// Collects a directory's full listing as (name, kind) pairs.
async fn list_dir(core: &FsCore, ino: u64) -> Vec<(String, FileType)> {
    let fh = core.opendir(ino).unwrap();
    let mut entries = Vec::new();
    let mut offset = 0;
    loop {
        let batch = core.readdir(fh, offset, 16).await.unwrap();
        if batch.is_empty() {
            break;
        }
        for (i, entry) in batch {
            entries.push((entry.name, entry.kind));
            offset = i + 1;
        }
    }
    core.releasedir(fh).unwrap();
    entries
}

// ==========================================================================
// Scenario: implicit directory lookup
// ==========================================================================

#[tokio::test]
async fn implicit_directory_is_synthesized_from_prefix() {
    let fx = fixture(|c| c.mount.implicit_directories = true);
    fx.fake.put("a/b", b"data");

    let resolved = fx.core.lookup(ROOT, "a").await.unwrap();
    assert!(resolved.inode.is_dir());

    let entries = list_dir(&fx.core, resolved.inode.ino().get()).await;
    assert_eq!(entries, vec![("b".to_string(), FileType::RegularFile)]);
}

#[tokio::test]
async fn implicit_directories_disabled_means_not_found() {
    let fx = fixture(|_| {});
    fx.fake.put("a/b", b"data");

    let result = fx.core.lookup(ROOT, "a").await;
    assert!(matches!(result, Err(FsError::NotFound(_))));
}

// ==========================================================================
// Scenario: conflicting file and directory names
// ==========================================================================

#[tokio::test]
async fn conflicting_names_expose_both_sides() {
    let fx = fixture(|_| {});
    fx.fake.put("x", b"taco");
    fx.fake.put("x/", b"");
    fx.fake.put("x/y", b"inner");

    // The listing shows the directory under the bare name and the file
    // under the suffixed spelling, in sorted order.
    let entries = list_dir(&fx.core, ROOT).await;
    assert_eq!(
        entries,
        vec![
            ("x".to_string(), FileType::Directory),
            ("x\n".to_string(), FileType::RegularFile),
        ]
    );

    // The bare name resolves to the directory.
    let dir = fx.core.lookup(ROOT, "x").await.unwrap();
    assert!(dir.inode.is_dir());

    // The suffixed name resolves to the file, and its content reads back.
    let file = fx.core.lookup(ROOT, "x\n").await.unwrap();
    assert!(!file.inode.is_dir());
    let fh = fx.core.open_file(file.inode.ino().get(), false).await.unwrap();
    let data = fx.core.read_file(fh, 0, 16).await.unwrap();
    assert_eq!(data, b"taco");
    fx.core.release_file(fh).await.unwrap();
}

// ==========================================================================
// Scenario: stat-cache staleness under TTL
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn stat_cache_serves_stale_size_until_ttl() {
    let fx = fixture(|c| c.metadata_cache.stat_cache_ttl = 10);

    // Write foo (4 bytes) through the mount at t=0.
    let (resolved, fh) = fx.core.create_file(ROOT, "foo").await.unwrap();
    let ino = resolved.inode.ino().get();
    fx.core.write_file(fh, 0, b"taco").await.unwrap();
    fx.core.flush_file(fh).await.unwrap();
    fx.core.release_file(fh).await.unwrap();

    // Out-of-band overwrite to 7 bytes at t=5.
    tokio::time::advance(Duration::from_secs(5)).await;
    fx.fake.put("foo", b"bigfile");

    // At t=6 the cached metadata is still fresh: size 4.
    tokio::time::advance(Duration::from_secs(1)).await;
    let attr = fx.core.getattr(ino).await.unwrap();
    assert_eq!(attr.size, 4);

    // Past the TTL the new size is visible.
    tokio::time::advance(Duration::from_secs(5)).await;
    let attr = fx.core.getattr(ino).await.unwrap();
    assert_eq!(attr.size, 7);
}

// ==========================================================================
// Scenario: conditional-commit clobber
// ==========================================================================

#[tokio::test]
async fn concurrent_writers_exactly_one_commit_wins() {
    let fx = fixture(|_| {});
    fx.fake.put("doc", b"v0");

    let resolved = fx.core.lookup(ROOT, "doc").await.unwrap();
    let ino = resolved.inode.ino().get();
    let base_generation = {
        let state = resolved.inode.as_file().unwrap().lock().unwrap();
        state.generation
    };

    // Both handles materialize from the same base generation.
    let fh_a = fx.core.open_file(ino, true).await.unwrap();
    let fh_b = fx.core.open_file(ino, true).await.unwrap();

    fx.core.write_file(fh_a, 0, b"from A").await.unwrap();
    fx.core.flush_file(fh_a).await.unwrap();

    let committed = {
        let state = resolved.inode.as_file().unwrap().lock().unwrap();
        state.generation
    };
    assert!(committed > base_generation, "generation must move forward");

    // B's close loses the race and the inode is clobbered.
    fx.core.write_file(fh_b, 0, b"from B").await.unwrap();
    let result = fx.core.flush_file(fh_b).await;
    assert!(matches!(result, Err(FsError::StaleHandle(_))));

    // Subsequent operations on the inode report the stale handle.
    let read = fx.core.read_file(fh_a, 0, 16).await;
    assert!(matches!(read, Err(FsError::StaleHandle(_))));

    assert_eq!(fx.fake.content_of("doc").unwrap(), b"from A");

    let _ = fx.core.release_file(fh_b).await;
    let _ = fx.core.release_file(fh_a).await;
}

// ==========================================================================
// Scenario: content-cache admission under pressure
// ==========================================================================

#[tokio::test]
async fn cache_pressure_evicts_unreferenced_entry() {
    let fx = fixture(|c| {
        c.file_cache.max_size_mb = 10;
        c.file_cache.download_chunk_size_mb = 1;
    });
    let six = vec![6u8; 6 << 20];
    let eight = vec![8u8; 8 << 20];
    fx.fake.put("six", &six);
    fx.fake.put("eight", &eight);

    // Fully read the 6 MiB file and drop the handle.
    let resolved = fx.core.lookup(ROOT, "six").await.unwrap();
    let fh = fx.core.open_file(resolved.inode.ino().get(), false).await.unwrap();
    let data = read_all(&fx.core, fh, six.len() as u64, 1 << 20).await;
    assert_eq!(data.len(), six.len());
    fx.core.release_file(fh).await.unwrap();

    let manager = fx.core.file_cache().unwrap();
    assert_eq!(manager.entry_count(), 1);
    assert_eq!(manager.total_size(), six.len() as u64);

    // Reading the 8 MiB file forces eviction of the idle 6 MiB entry.
    let resolved = fx.core.lookup(ROOT, "eight").await.unwrap();
    let fh = fx.core.open_file(resolved.inode.ino().get(), false).await.unwrap();
    let data = read_all(&fx.core, fh, eight.len() as u64, 1 << 20).await;
    assert_eq!(data.len(), eight.len());
    fx.core.release_file(fh).await.unwrap();

    assert_eq!(manager.entry_count(), 1);
    assert_eq!(manager.total_size(), eight.len() as u64);
}

// ==========================================================================
// Scenario: rate-limit pacing
// ==========================================================================

#[tokio::test(start_paused = true)]
async fn lookups_are_paced_by_the_op_rate_limit() {
    let fx = fixture(|c| {
        c.store.op_rate_limit = 10.0;
        // Effectively disable metadata caching so every lookup reaches
        // the store.
        c.metadata_cache.stat_cache_ttl = 0;
        c.metadata_cache.type_cache_ttl = 0;
        c.store.request_timeout = 3600;
    });
    for i in 0..20 {
        fx.fake.put(&format!("file{i:02}"), b"x");
    }

    // Each lookup of an existing file costs two stats (file spelling and
    // marker spelling): 40 ops at 10/s with a burst of 10 needs >= 3 s.
    let start = tokio::time::Instant::now();
    for i in 0..20 {
        fx.core.lookup(ROOT, &format!("file{i:02}")).await.unwrap();
    }
    let elapsed = tokio::time::Instant::now() - start;
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
}

// ==========================================================================
// Mutations: create, mkdir, unlink, rmdir, rename
// ==========================================================================

#[tokio::test]
async fn created_file_is_visible_before_first_upload() {
    let fx = fixture(|_| {});
    let (resolved, fh) = fx.core.create_file(ROOT, "draft.txt").await.unwrap();

    // Visible to lookup and readdir while purely local.
    let found = fx.core.lookup(ROOT, "draft.txt").await.unwrap();
    assert_eq!(found.inode.ino(), resolved.inode.ino());
    let entries = list_dir(&fx.core, ROOT).await;
    assert!(entries.contains(&("draft.txt".to_string(), FileType::RegularFile)));
    assert!(!fx.fake.contains("draft.txt"), "not uploaded yet");

    // Flush commits it with a must-not-exist precondition.
    fx.core.write_file(fh, 0, b"hello").await.unwrap();
    fx.core.flush_file(fh).await.unwrap();
    fx.core.release_file(fh).await.unwrap();
    assert_eq!(fx.fake.content_of("draft.txt").unwrap(), b"hello");
}

#[tokio::test]
async fn mkdir_creates_marker_and_rmdir_removes_it() {
    let fx = fixture(|_| {});
    let resolved = fx.core.mkdir(ROOT, "album").await.unwrap();
    assert!(resolved.inode.is_dir());
    assert!(fx.fake.contains("album/"));

    // A second mkdir conflicts.
    let again = fx.core.mkdir(ROOT, "album").await;
    assert!(matches!(again, Err(FsError::Exists(_))));

    fx.core.rmdir(ROOT, "album").await.unwrap();
    assert!(!fx.fake.contains("album/"));
}

#[tokio::test]
async fn rmdir_refuses_non_empty_directory() {
    let fx = fixture(|_| {});
    fx.fake.put("album/", b"");
    fx.fake.put("album/pic", b"data");

    let result = fx.core.rmdir(ROOT, "album").await;
    assert!(matches!(result, Err(FsError::NotEmpty(_))));
    assert!(fx.fake.contains("album/"));
}

#[tokio::test]
async fn unlink_removes_object_and_listing_entry() {
    let fx = fixture(|_| {});
    fx.fake.put("junk", b"x");

    fx.core.lookup(ROOT, "junk").await.unwrap();
    fx.core.unlink(ROOT, "junk").await.unwrap();
    assert!(!fx.fake.contains("junk"));

    let result = fx.core.lookup(ROOT, "junk").await;
    assert!(matches!(result, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn rename_file_moves_object() {
    let fx = fixture(|_| {});
    fx.fake.put("old-name", b"contents");

    fx.core.rename(ROOT, "old-name", ROOT, "new-name").await.unwrap();
    assert!(!fx.fake.contains("old-name"));
    assert_eq!(fx.fake.content_of("new-name").unwrap(), b"contents");

    let resolved = fx.core.lookup(ROOT, "new-name").await.unwrap();
    assert!(!resolved.inode.is_dir());
}

#[tokio::test]
async fn rename_directory_over_budget_has_no_effect() {
    let fx = fixture(|_| {}); // rename_dir_limit defaults to 0
    fx.fake.put("src/", b"");
    fx.fake.put("src/a", b"1");
    fx.fake.put("src/b", b"2");

    let result = fx.core.rename(ROOT, "src", ROOT, "dst").await;
    assert!(matches!(result, Err(FsError::Invalid(_))));

    // Nothing moved.
    assert!(fx.fake.contains("src/a"));
    assert!(fx.fake.contains("src/b"));
    assert!(!fx.fake.contains("dst/a"));
    assert!(!fx.fake.contains("dst/"));
}

#[tokio::test]
async fn rename_directory_within_budget_moves_all_entries() {
    let fx = fixture(|c| c.mount.rename_dir_limit = 8);
    fx.fake.put("src/", b"");
    fx.fake.put("src/a", b"1");
    fx.fake.put("src/deep/b", b"2");

    fx.core.rename(ROOT, "src", ROOT, "dst").await.unwrap();
    assert_eq!(fx.fake.content_of("dst/a").unwrap(), b"1");
    assert_eq!(fx.fake.content_of("dst/deep/b").unwrap(), b"2");
    assert!(fx.fake.contains("dst/"));
    assert!(!fx.fake.contains("src/a"));
    assert!(!fx.fake.contains("src/"));
}

// ==========================================================================
// Properties
// ==========================================================================

#[tokio::test]
async fn lookup_is_idempotent_while_referenced() {
    let fx = fixture(|_| {});
    fx.fake.put("stable", b"x");

    let first = fx.core.lookup(ROOT, "stable").await.unwrap();
    let second = fx.core.lookup(ROOT, "stable").await.unwrap();
    assert_eq!(first.inode.ino(), second.inode.ino());

    // Fully forgotten, the number may be reassigned; a fresh lookup must
    // still resolve.
    fx.core.forget(first.inode.ino().get(), 2);
    let third = fx.core.lookup(ROOT, "stable").await.unwrap();
    assert!(!third.inode.is_dir());
}

#[tokio::test]
async fn listing_order_is_stable_across_offsets() {
    let fx = fixture(|_| {});
    for i in 0..30 {
        fx.fake.put(&format!("f{i:03}"), b"x");
    }

    let all = list_dir(&fx.core, ROOT).await;
    assert_eq!(all.len(), 30);
    let names: Vec<&String> = all.iter().map(|(n, _)| n).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted, "listing must be lexicographic");

    // Re-reading from a mid-stream offset returns the same suffix.
    let fh = fx.core.opendir(ROOT).unwrap();
    let tail = fx.core.readdir(fh, 10, 100).await.unwrap();
    assert_eq!(tail.len(), 20);
    assert_eq!(tail[0].1.name, all[10].0);
    fx.core.releasedir(fh).unwrap();
}

#[tokio::test]
async fn symlinks_round_trip_through_custom_metadata() {
    let fx = fixture(|_| {});
    let resolved = fx.core.symlink(ROOT, "link", "/target/elsewhere").await.unwrap();
    assert_eq!(resolved.attr.kind, FileType::Symlink);

    let target = fx.core.readlink(resolved.inode.ino().get()).unwrap();
    assert_eq!(target, "/target/elsewhere");

    // Listing reports the symlink kind from object metadata.
    let entries = list_dir(&fx.core, ROOT).await;
    assert_eq!(entries, vec![("link".to_string(), FileType::Symlink)]);
}

#[tokio::test]
async fn generation_xattrs_are_exposed_read_only() {
    let fx = fixture(|_| {});
    let metadata = fx.fake.put("doc", b"x");
    let resolved = fx.core.lookup(ROOT, "doc").await.unwrap();
    let ino = resolved.inode.ino().get();

    let value = fx.core.getxattr(ino, xattr::GENERATION).unwrap();
    assert_eq!(
        String::from_utf8(value).unwrap(),
        metadata.generation.get().to_string()
    );
    assert!(matches!(
        fx.core.setxattr(ino, xattr::GENERATION),
        Err(FsError::NotSupported)
    ));

    let names = fx.core.listxattr(ino).unwrap();
    let listed = String::from_utf8(names).unwrap();
    assert!(listed.contains("user.bucketfs.generation"));
}

#[tokio::test]
async fn streaming_writes_compose_on_close() {
    let fx = fixture(|c| {
        c.write.enable_streaming_writes = true;
        c.write.write_buffer_size_mb = 1;
    });

    let (_, fh) = fx.core.create_file(ROOT, "big.log").await.unwrap();
    // Three 1 MiB appends: at least two part uploads before the close.
    let chunk = vec![1u8; 1 << 20];
    for i in 0..3u64 {
        fx.core.write_file(fh, i * (1 << 20), &chunk).await.unwrap();
    }
    fx.core.flush_file(fh).await.unwrap();
    fx.core.release_file(fh).await.unwrap();

    let content = fx.fake.content_of("big.log").unwrap();
    assert_eq!(content.len(), 3 << 20);
    // No temporary part objects survive the close.
    assert_eq!(fx.fake.object_names(), vec!["big.log".to_string()]);
}

#[tokio::test]
async fn read_your_own_writes_on_a_write_handle() {
    let fx = fixture(|_| {});
    fx.fake.put("notes", b"0123456789");

    let resolved = fx.core.lookup(ROOT, "notes").await.unwrap();
    let fh = fx.core.open_file(resolved.inode.ino().get(), true).await.unwrap();

    fx.core.write_file(fh, 3, b"ABC").await.unwrap();
    let data = fx.core.read_file(fh, 0, 16).await.unwrap();
    assert_eq!(data, b"012ABC6789");

    // Nothing is committed until flush.
    assert_eq!(fx.fake.content_of("notes").unwrap(), b"0123456789");
    fx.core.flush_file(fh).await.unwrap();
    assert_eq!(fx.fake.content_of("notes").unwrap(), b"012ABC6789");
    fx.core.release_file(fh).await.unwrap();
}

#[tokio::test]
async fn only_dir_projects_a_subtree() {
    let fx = fixture(|c| c.mount.only_dir = "photos".to_string());
    fx.fake.put("photos/cat.jpg", b"meow");
    fx.fake.put("docs/readme", b"elsewhere");

    let entries = list_dir(&fx.core, ROOT).await;
    assert_eq!(entries, vec![("cat.jpg".to_string(), FileType::RegularFile)]);

    let resolved = fx.core.lookup(ROOT, "cat.jpg").await.unwrap();
    let fh = fx.core.open_file(resolved.inode.ino().get(), false).await.unwrap();
    assert_eq!(fx.core.read_file(fh, 0, 16).await.unwrap(), b"meow");
    fx.core.release_file(fh).await.unwrap();

    // Names outside the projected prefix do not resolve.
    assert!(fx.core.lookup(ROOT, "docs").await.is_err());
}

#[tokio::test]
async fn repeated_lookups_of_absent_names_hit_the_store_once() {
    let fx = fixture(|_| {});

    for _ in 0..5 {
        let result = fx.core.lookup(ROOT, "ghost").await;
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }
    // First miss costs a stat for each spelling; the type cache absorbs
    // the rest.
    assert_eq!(fx.fake.stat_calls(), 2);
}

#[tokio::test]
async fn operations_on_distinct_inodes_run_concurrently() {
    let fx = fixture(|_| {});
    for i in 0..8 {
        fx.fake.put(&format!("file{i}"), format!("content-{i}").as_bytes());
    }

    let core = Arc::new(fx.core);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let core = Arc::clone(&core);
        tasks.push(tokio::spawn(async move {
            let name = format!("file{i}");
            let resolved = core.lookup(ROOT, &name).await.unwrap();
            let fh = core.open_file(resolved.inode.ino().get(), false).await.unwrap();
            let data = core.read_file(fh, 0, 64).await.unwrap();
            core.release_file(fh).await.unwrap();
            assert_eq!(data, format!("content-{i}").as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn rename_over_an_existing_destination_replaces_it() {
    let fx = fixture(|_| {});
    fx.fake.put("winner", b"new");
    fx.fake.put("loser", b"old");

    fx.core.rename(ROOT, "winner", ROOT, "loser").await.unwrap();
    assert!(!fx.fake.contains("winner"));
    assert_eq!(fx.fake.content_of("loser").unwrap(), b"new");
}

#[tokio::test]
async fn truncate_through_setattr_commits_new_generation() {
    let fx = fixture(|_| {});
    fx.fake.put("doc", b"abcdef");

    let resolved = fx.core.lookup(ROOT, "doc").await.unwrap();
    let ino = resolved.inode.ino().get();

    let attr = fx.core.setattr(ino, Some(3), None, None).await.unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(fx.fake.content_of("doc").unwrap(), b"abc");
}
