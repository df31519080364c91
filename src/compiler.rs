//! External compiler invocation.
//!
//! The engine does not manage toolchains; it invokes one configured
//! command to turn generated source into a shared library. [`Compiler`]
//! is the seam the coordinator depends on; [`CommandCompiler`] assembles
//! a gcc-compatible command line from [`BuildParams`] and runs it with
//! captured output.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Compile result type.
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors from compiler invocation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to launch compiler `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("compiler exited with status {code:?}; last output:\n{excerpt}")]
    CommandFailed {
        code: Option<i32>,
        excerpt: String,
        log: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Compiled artifact bytes plus the captured build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    pub binary: Vec<u8>,
    pub log: String,
}

/// Compiler capability: turn source text into shared-library bytes.
pub trait Compiler {
    fn compile(&self, source: &str) -> CompileResult<CompileOutput>;
}

/// Compiler command configuration. Defaults assume gcc compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildParams {
    /// Compiler executable.
    pub cxx: String,
    /// Flags always passed.
    pub cxxflags: Vec<String>,
    /// Extra flags in debug mode.
    pub cxxflags_debug: Vec<String>,
    /// Extra flags in optimized (default) mode.
    pub cxxflags_opt: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub lib_dirs: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub debug: bool,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            cxx: "c++".to_string(),
            cxxflags: vec![
                "-shared".to_string(),
                "-fPIC".to_string(),
                "-fvisibility=hidden".to_string(),
            ],
            cxxflags_debug: vec!["-g".to_string(), "-O0".to_string()],
            cxxflags_opt: vec!["-O3".to_string()],
            include_dirs: Vec::new(),
            lib_dirs: Vec::new(),
            libs: Vec::new(),
            debug: false,
        }
    }
}

/// Runs the configured compile command in a scratch directory.
#[derive(Debug, Clone, Default)]
pub struct CommandCompiler {
    params: BuildParams,
    scratch_root: Option<PathBuf>,
}

impl CommandCompiler {
    pub fn new(params: BuildParams) -> Self {
        Self {
            params,
            scratch_root: None,
        }
    }

    /// Place scratch directories under `root` instead of the system
    /// temporary directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Argument vector for compiling `src` into `out`, excluding the
    /// compiler executable itself.
    fn command_args(&self, src: &Path, out: &Path) -> Vec<String> {
        let p = &self.params;
        let mut args = p.cxxflags.clone();
        if p.debug {
            args.extend(p.cxxflags_debug.iter().cloned());
        } else {
            args.extend(p.cxxflags_opt.iter().cloned());
        }
        args.extend(p.include_dirs.iter().map(|d| format!("-I{}", d.display())));
        args.extend(p.lib_dirs.iter().map(|d| format!("-L{}", d.display())));
        args.extend(p.libs.iter().map(|l| format!("-l{l}")));
        args.push("-o".to_string());
        args.push(out.display().to_string());
        args.push(src.display().to_string());
        args
    }

    fn run_in(&self, scratch: &Path, source: &str) -> CompileResult<CompileOutput> {
        let src_path = scratch.join("source.cpp");
        let out_path = scratch.join("out.so");
        fs::write(&src_path, source)?;

        let args = self.command_args(&src_path, &out_path);
        let rendered = format!("{} {}", self.params.cxx, args.join(" "));

        let output = Command::new(&self.params.cxx)
            .args(&args)
            .output()
            .map_err(|e| CompileError::Launch {
                program: self.params.cxx.clone(),
                source: e,
            })?;

        let mut log = format!("$ {rendered}\n");
        log.push_str(&String::from_utf8_lossy(&output.stdout));
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(CompileError::CommandFailed {
                code: output.status.code(),
                excerpt: log_excerpt(&log, 20),
                log,
            });
        }

        let binary = fs::read(&out_path)?;
        Ok(CompileOutput { binary, log })
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, source: &str) -> CompileResult<CompileOutput> {
        let scratch = self
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("kiln-build-{}", Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;

        let result = self.run_in(&scratch, source);
        let _ = fs::remove_dir_all(&scratch);
        result
    }
}

/// Last `max_lines` lines of a build log, for error messages.
fn log_excerpt(log: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_shape() {
        let compiler = CommandCompiler::default();
        let args = compiler.command_args(Path::new("in.cpp"), Path::new("out.so"));
        assert_eq!(
            args,
            vec![
                "-shared",
                "-fPIC",
                "-fvisibility=hidden",
                "-O3",
                "-o",
                "out.so",
                "in.cpp"
            ]
        );
    }

    #[test]
    fn test_debug_flags_replace_opt_flags() {
        let params = BuildParams {
            debug: true,
            ..BuildParams::default()
        };
        let compiler = CommandCompiler::new(params);
        let args = compiler.command_args(Path::new("in.cpp"), Path::new("out.so"));
        assert!(args.contains(&"-g".to_string()));
        assert!(args.contains(&"-O0".to_string()));
        assert!(!args.contains(&"-O3".to_string()));
    }

    #[test]
    fn test_include_lib_and_link_flags() {
        let params = BuildParams {
            include_dirs: vec![PathBuf::from("/opt/inc")],
            lib_dirs: vec![PathBuf::from("/opt/lib")],
            libs: vec!["m".to_string()],
            ..BuildParams::default()
        };
        let compiler = CommandCompiler::new(params);
        let args = compiler.command_args(Path::new("in.cpp"), Path::new("out.so"));
        assert!(args.contains(&"-I/opt/inc".to_string()));
        assert!(args.contains(&"-L/opt/lib".to_string()));
        assert!(args.contains(&"-lm".to_string()));
    }

    #[test]
    fn test_log_excerpt_takes_tail() {
        let log: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let excerpt = log_excerpt(&log, 5);
        assert!(excerpt.starts_with("line 25"));
        assert!(excerpt.ends_with("line 29"));
    }

    #[cfg(unix)]
    mod with_fake_toolchain {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// A stand-in "compiler" that copies its input to the -o target.
        fn fake_cc(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-cc");
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        const COPYING_CC: &str = "#!/bin/sh\n\
            out=\"\"\nsrc=\"\"\n\
            while [ $# -gt 0 ]; do\n\
              case \"$1\" in\n\
                -o) out=\"$2\"; shift 2 ;;\n\
                -*) shift ;;\n\
                *) src=\"$1\"; shift ;;\n\
              esac\n\
            done\n\
            cat \"$src\" > \"$out\"\n\
            echo \"compiled $src\"\n";

        const FAILING_CC: &str = "#!/bin/sh\n\
            echo \"fatal error: no can do\" >&2\n\
            exit 2\n";

        #[test]
        fn test_compile_produces_binary_and_log() {
            let temp = TempDir::new().unwrap();
            let params = BuildParams {
                cxx: fake_cc(temp.path(), COPYING_CC).display().to_string(),
                ..BuildParams::default()
            };
            let compiler =
                CommandCompiler::new(params).with_scratch_root(temp.path().join("scratch"));

            let out = compiler.compile("int f() { return 7; }\n").unwrap();

            assert_eq!(out.binary, b"int f() { return 7; }\n");
            assert!(out.log.contains("compiled"));
        }

        #[test]
        fn test_failed_compile_surfaces_log() {
            let temp = TempDir::new().unwrap();
            let params = BuildParams {
                cxx: fake_cc(temp.path(), FAILING_CC).display().to_string(),
                ..BuildParams::default()
            };
            let compiler =
                CommandCompiler::new(params).with_scratch_root(temp.path().join("scratch"));

            match compiler.compile("whatever") {
                Err(CompileError::CommandFailed { code, excerpt, log }) => {
                    assert_eq!(code, Some(2));
                    assert!(excerpt.contains("no can do"));
                    assert!(log.contains("no can do"));
                }
                other => panic!("expected CommandFailed, got {other:?}"),
            }
        }

        #[test]
        fn test_missing_compiler_is_a_launch_error() {
            let temp = TempDir::new().unwrap();
            let params = BuildParams {
                cxx: "/no/such/compiler".to_string(),
                ..BuildParams::default()
            };
            let compiler =
                CommandCompiler::new(params).with_scratch_root(temp.path().join("scratch"));

            match compiler.compile("x") {
                Err(CompileError::Launch { program, .. }) => {
                    assert_eq!(program, "/no/such/compiler");
                }
                other => panic!("expected Launch error, got {other:?}"),
            }
        }
    }
}
