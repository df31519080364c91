//! Root-policy distribution tests.
//!
//! One global builder, several physical cache directories: the compiled
//! bytes must reach every directory through the node-roots broadcast,
//! with exactly one compiler invocation in the whole group.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use common::{fake_binary, test_config, RecordingCompiler};
use kiln::{
    BuildCoordinator, BuildPolicy, CacheKey, CachedLibrary, CompileOutput, CoordinatorError,
    EntryStatus, GroupContext, JitError, SourceStorage, Store,
};
use kiln_comm::LocalComm;

const SOURCE_D: &str = "extern \"C\" int answer() { return 42; }";
const COMM_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a root-policy acquisition on every rank; `dirs[rank]` is each
/// member's cache root.
fn run_root_policy<G>(
    dirs: Vec<PathBuf>,
    compiler: RecordingCompiler,
    signature: &'static str,
    generate: G,
) -> Vec<Result<CachedLibrary, JitError>>
where
    G: Fn(usize) -> Result<String, kiln::GeneratorError> + Send + Sync + 'static,
{
    let size = dirs.len();
    let comms = LocalComm::create(size, COMM_TIMEOUT);
    let dirs = Arc::new(dirs);
    let generate = Arc::new(generate);

    let handles: Vec<_> = comms
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let dirs = Arc::clone(&dirs);
            let generate = Arc::clone(&generate);
            let compiler = compiler.clone();
            thread::spawn(move || {
                let config = test_config(&dirs[rank], BuildPolicy::Root);
                let coordinator = BuildCoordinator::open(compiler, config).unwrap();
                let ctx =
                    GroupContext::establish(&comm, &dirs[rank], BuildPolicy::Root).unwrap();
                coordinator.acquire(signature, |_| generate(rank), Some(&ctx))
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Two directories, two ranks each: ranks 0,1 on node A; ranks 2,3 on
/// node B.
fn two_node_dirs(temp_a: &TempDir, temp_b: &TempDir) -> Vec<PathBuf> {
    vec![
        temp_a.path().to_path_buf(),
        temp_a.path().to_path_buf(),
        temp_b.path().to_path_buf(),
        temp_b.path().to_path_buf(),
    ]
}

// =============================================================================
// Distribution of a fresh build
// =============================================================================

#[test]
fn test_one_global_build_reaches_every_directory() {
    let temp_a = TempDir::new().unwrap();
    let temp_b = TempDir::new().unwrap();
    let compiler = RecordingCompiler::new();

    let results = run_root_policy(
        two_node_dirs(&temp_a, &temp_b),
        compiler.clone(),
        "sig-dist",
        |_| Ok(SOURCE_D.to_string()),
    );

    assert_eq!(compiler.count(), 1, "one compile for the whole group");

    let expected = fake_binary(SOURCE_D);
    for result in &results {
        let library = result.as_ref().unwrap();
        assert_eq!(fs::read(&library.path).unwrap(), expected);
    }

    // The receiver's directory holds a complete, independently readable
    // entry, including the redistributed source.
    let store_b = Store::open(temp_b.path(), SourceStorage::Compress).unwrap();
    let key = CacheKey::from_signature("sig-dist");
    assert_eq!(store_b.lookup(&key), EntryStatus::Ready);
    assert_eq!(store_b.read_source(&key).unwrap().as_deref(), Some(SOURCE_D));
}

#[test]
fn test_three_singleton_directories() {
    let temps: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let dirs: Vec<PathBuf> = temps.iter().map(|t| t.path().to_path_buf()).collect();
    let compiler = RecordingCompiler::new();

    let results = run_root_policy(dirs.clone(), compiler.clone(), "sig-three", |_| {
        Ok(SOURCE_D.to_string())
    });

    assert_eq!(compiler.count(), 1);
    for (i, result) in results.iter().enumerate() {
        assert!(result.is_ok(), "rank {i} must succeed");
    }
    for dir in &dirs {
        let store = Store::open(dir, SourceStorage::Compress).unwrap();
        let key = CacheKey::from_signature("sig-three");
        assert_eq!(store.lookup(&key), EntryStatus::Ready);
    }
}

// =============================================================================
// Hits and mixed states
// =============================================================================

fn prepublish(dir: &std::path::Path, signature: &str) {
    let store = Store::open(dir, SourceStorage::Compress).unwrap();
    let key = CacheKey::from_signature(signature);
    store
        .publish(
            &key,
            signature,
            SOURCE_D,
            &CompileOutput {
                binary: fake_binary(SOURCE_D),
                log: String::new(),
            },
        )
        .unwrap();
}

#[test]
fn test_uniform_hit_skips_compiler_everywhere() {
    let temp_a = TempDir::new().unwrap();
    let temp_b = TempDir::new().unwrap();
    prepublish(temp_a.path(), "sig-hit");
    prepublish(temp_b.path(), "sig-hit");

    let compiler = RecordingCompiler::new();
    let results = run_root_policy(
        two_node_dirs(&temp_a, &temp_b),
        compiler.clone(),
        "sig-hit",
        |_| Err(kiln::GeneratorError::new("generator must stay cold")),
    );

    assert_eq!(compiler.count(), 0);
    for result in &results {
        assert!(result.is_ok());
    }
}

#[test]
fn test_hit_on_builder_side_still_feeds_missing_directory() {
    let temp_a = TempDir::new().unwrap();
    let temp_b = TempDir::new().unwrap();
    // Only the builder's directory has the entry.
    prepublish(temp_a.path(), "sig-lopsided");

    let compiler = RecordingCompiler::new();
    let results = run_root_policy(
        two_node_dirs(&temp_a, &temp_b),
        compiler.clone(),
        "sig-lopsided",
        |_| Err(kiln::GeneratorError::new("generator must stay cold")),
    );

    // Served from the builder's store: no compile, no generation.
    assert_eq!(compiler.count(), 0);
    for result in &results {
        assert!(result.is_ok());
    }

    let store_b = Store::open(temp_b.path(), SourceStorage::Compress).unwrap();
    let key = CacheKey::from_signature("sig-lopsided");
    let (lib, _) = store_b.open_for_read(&key).unwrap();
    assert_eq!(fs::read(lib).unwrap(), fake_binary(SOURCE_D));
}

// =============================================================================
// Builder failure propagation
// =============================================================================

#[test]
fn test_builder_failure_reaches_every_member() {
    let temp_a = TempDir::new().unwrap();
    let temp_b = TempDir::new().unwrap();
    let compiler = RecordingCompiler::new();

    let results = run_root_policy(
        two_node_dirs(&temp_a, &temp_b),
        compiler.clone(),
        "sig-doomed",
        |rank| {
            if rank == 0 {
                Err(kiln::GeneratorError::new("generator declined"))
            } else {
                Ok(SOURCE_D.to_string())
            }
        },
    );

    assert_eq!(compiler.count(), 0);

    // Builder: its own generator error.
    match &results[0] {
        Err(JitError::Generator { signature, .. }) => assert_eq!(signature, "sig-doomed"),
        other => panic!("expected generator failure on the builder, got {other:?}"),
    }
    // Everyone else: the peer failure, with the builder's detail.
    for result in &results[1..] {
        match result {
            Err(JitError::Coordinator(CoordinatorError::PeerBuildFailed {
                signature,
                detail,
            })) => {
                assert_eq!(signature, "sig-doomed");
                assert!(detail.contains("generator declined"));
            }
            other => panic!("expected PeerBuildFailed, got {other:?}"),
        }
    }
}
