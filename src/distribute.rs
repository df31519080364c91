//! Distribution of built artifacts between node groups.
//!
//! Under the `root` build policy only one process in the whole group runs
//! the compiler. The other node groups' roots receive the result over the
//! group's broadcast primitive and republish it into their own store, so
//! the waiters in their groups observe an ordinary local cache hit.
//!
//! The wire frame is a status byte followed by u64-LE length-prefixed
//! segments. A builder whose build failed still completes the collective
//! with a failure frame; receivers then fail fast with the builder's
//! error instead of deadlocking in a half-attended broadcast.

use thiserror::Error;

use crate::compiler::CompileOutput;

const FRAME_FAILED: u8 = 0;
const FRAME_OK: u8 = 1;

/// Frame decode result type.
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors from frame decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("distribution frame truncated")]
    Truncated,

    #[error("unknown distribution frame status {0}")]
    UnknownStatus(u8),
}

/// Payload broadcast from the global builder to the other node roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFrame {
    /// Successful build: generated source, compiled binary, build log.
    Built {
        source: String,
        binary: Vec<u8>,
        log: String,
    },
    /// The build failed; the detail lets receivers surface context.
    Failed { detail: String },
}

impl BuildFrame {
    pub fn built(source: String, output: CompileOutput) -> Self {
        BuildFrame::Built {
            source,
            binary: output.binary,
            log: output.log,
        }
    }
}

pub fn encode_frame(frame: &BuildFrame) -> Vec<u8> {
    match frame {
        BuildFrame::Built {
            source,
            binary,
            log,
        } => {
            let mut out =
                Vec::with_capacity(1 + 24 + source.len() + binary.len() + log.len());
            out.push(FRAME_OK);
            push_segment(&mut out, source.as_bytes());
            push_segment(&mut out, binary);
            push_segment(&mut out, log.as_bytes());
            out
        }
        BuildFrame::Failed { detail } => {
            let mut out = Vec::with_capacity(1 + 8 + detail.len());
            out.push(FRAME_FAILED);
            push_segment(&mut out, detail.as_bytes());
            out
        }
    }
}

pub fn decode_frame(bytes: &[u8]) -> FrameResult<BuildFrame> {
    let (&status, mut rest) = bytes.split_first().ok_or(FrameError::Truncated)?;
    match status {
        FRAME_OK => {
            let source = take_segment(&mut rest)?;
            let binary = take_segment(&mut rest)?;
            let log = take_segment(&mut rest)?;
            Ok(BuildFrame::Built {
                source: String::from_utf8_lossy(&source).into_owned(),
                binary,
                log: String::from_utf8_lossy(&log).into_owned(),
            })
        }
        FRAME_FAILED => {
            let detail = take_segment(&mut rest)?;
            Ok(BuildFrame::Failed {
                detail: String::from_utf8_lossy(&detail).into_owned(),
            })
        }
        other => Err(FrameError::UnknownStatus(other)),
    }
}

fn push_segment(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_segment(rest: &mut &[u8]) -> FrameResult<Vec<u8>> {
    if rest.len() < 8 {
        return Err(FrameError::Truncated);
    }
    let (len_bytes, tail) = rest.split_at(8);
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(len_bytes);
    let len = u64::from_le_bytes(len_buf) as usize;
    if tail.len() < len {
        return Err(FrameError::Truncated);
    }
    let (segment, tail) = tail.split_at(len);
    *rest = tail;
    Ok(segment.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_frame_round_trips() {
        let frame = BuildFrame::Built {
            source: "int f() { return 1; }".to_string(),
            binary: vec![0x7f, b'E', b'L', b'F', 0, 1, 2, 3],
            log: "all good".to_string(),
        };
        let decoded = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_failed_frame_round_trips() {
        let frame = BuildFrame::Failed {
            detail: "compiler exited with status Some(1)".to_string(),
        };
        let decoded = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_segments_round_trip() {
        let frame = BuildFrame::Built {
            source: String::new(),
            binary: Vec::new(),
            log: String::new(),
        };
        let decoded = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_large_binary_round_trips() {
        let frame = BuildFrame::Built {
            source: "s".repeat(1024),
            binary: (0..=255u8).cycle().take(1 << 20).collect(),
            log: String::new(),
        };
        let decoded = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(matches!(decode_frame(&[]), Err(FrameError::Truncated)));
        assert!(matches!(decode_frame(&[FRAME_OK]), Err(FrameError::Truncated)));

        let mut bytes = encode_frame(&BuildFrame::Failed {
            detail: "oops".to_string(),
        });
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode_frame(&bytes), Err(FrameError::Truncated)));
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(matches!(
            decode_frame(&[9, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::UnknownStatus(9))
        ));
    }
}
