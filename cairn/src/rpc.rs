/*!
The wire protocol for remote repositories.

When a repository lives on another machine, a helper process runs beside
it and the two engine instances exchange framed messages over a
bidirectional byte stream (in practice the stdin/stdout of an SSH child;
spawning that child is transport and happens elsewhere). Methods mirror
the repository API. All decryption happens on the client: objects cross
the wire as opaque envelopes and the serving side never sees key
material, which is also why `check --verify-data` cannot run remotely.

Frames are a little-endian u32 length prefix followed by a MessagePack
message.
*/
use crate::config::EngineConfig;
use crate::repository::{CheckOptions, Repository, RepositoryError};
use cairn_core::repository::{Chunk, ChunkId};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::Path;

/// Upper bound on one frame, to keep corrupt length prefixes from driving
/// giant allocations
pub const MAX_FRAME: u32 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error on RPC stream")]
    IOError(#[from] std::io::Error),
    #[error("Frame failed to serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Frame is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Frame length {0} exceeds the limit")]
    OversizeFrame(u32),
    #[error("Peer reported error: {0}")]
    Remote(String),
}

type Result<T> = std::result::Result<T, RpcError>;

/// Requests a client may send; one response follows each request
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum Request {
    /// Must be the first request; everything else requires an open
    /// repository
    Open { path: String, writable: bool },
    /// Stores an already-packed object envelope
    Put {
        id: ChunkId,
        #[serde(with = "serde_bytes")]
        envelope: Vec<u8>,
    },
    /// Fetches an object envelope
    Get { id: ChunkId },
    Delete { id: ChunkId },
    /// Commits the transaction, recording the client's nonce high-water
    /// mark
    Commit { nonce_high_water: Option<u64> },
    List,
    /// Storage-level check; data verification needs the key and therefore
    /// runs client-side
    Check { repair: bool },
    /// Fetches the wrapped key material embedded in the repository config
    /// (repokey mode)
    LoadKey,
    Close,
}

/// Error classes a server reports, mirroring the local error taxonomy
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Missing,
    Integrity,
    Locked,
    Security,
    Transient,
    Usage,
    Other,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum Response {
    Ok,
    Opened {
        repository_id: String,
    },
    Envelope {
        #[serde(with = "serde_bytes")]
        envelope: Vec<u8>,
    },
    Ids(Vec<ChunkId>),
    CheckReport {
        errors: Vec<String>,
        complete: bool,
    },
    Key {
        #[serde(with = "serde_bytes")]
        wrapped: Vec<u8>,
    },
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

/// Writes one length-prefixed frame
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<()> {
    let payload = rmp_serde::to_vec(message)?;
    if payload.len() as u32 > MAX_FRAME {
        return Err(RpcError::OversizeFrame(payload.len() as u32));
    }
    writer.write_u32::<LE>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame; `Ok(None)` on clean end of stream
pub fn read_frame<T: for<'de> Deserialize<'de>>(reader: &mut impl Read) -> Result<Option<T>> {
    let length = match reader.read_u32::<LE>() {
        Ok(length) => length,
        Err(ref err) if err.kind() == IoErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if length > MAX_FRAME {
        return Err(RpcError::OversizeFrame(length));
    }
    let mut payload = vec![0_u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(rmp_serde::decode::from_read(&payload[..])?))
}

fn classify(err: &RepositoryError) -> RemoteErrorKind {
    match err {
        RepositoryError::ObjectMissing(_) => RemoteErrorKind::Missing,
        RepositoryError::ObjectCorrupt { .. }
        | RepositoryError::Segment(_)
        | RepositoryError::Chunk(_) => RemoteErrorKind::Integrity,
        RepositoryError::Lock(_) => RemoteErrorKind::Locked,
        RepositoryError::Security(_) | RepositoryError::Nonce(_) => RemoteErrorKind::Security,
        RepositoryError::IOError(_) => RemoteErrorKind::Transient,
        RepositoryError::ReadOnly | RepositoryError::Usage(_) => RemoteErrorKind::Usage,
        _ => RemoteErrorKind::Other,
    }
}

fn error_response(err: &RepositoryError) -> Response {
    Response::Error {
        kind: classify(err),
        message: err.to_string(),
    }
}

/// Serves repository operations over a byte stream until the peer closes
/// it or sends `Close`.
///
/// Holds at most one open repository. Errors in handling one request are
/// reported to the peer and do not end the session; only transport
/// failures do.
#[instrument(skip(engine, input, output))]
pub fn serve(engine: &EngineConfig, mut input: impl Read, mut output: impl Write) -> Result<()> {
    let mut repo: Option<Repository> = None;
    info!("RPC serve loop starting");
    while let Some(request) = read_frame::<Request>(&mut input)? {
        let response = handle(engine, &mut repo, request);
        let closing = matches!(response, Response::Ok) && repo.is_none();
        write_frame(&mut output, &response)?;
        if closing {
            break;
        }
    }
    debug!("RPC serve loop finished");
    Ok(())
}

fn handle(engine: &EngineConfig, repo: &mut Option<Repository>, request: Request) -> Response {
    match request {
        Request::Open { path, writable } => {
            match Repository::open_serving(Path::new(&path), engine, writable) {
                Ok(opened) => {
                    let id = opened.config.id.to_string();
                    *repo = Some(opened);
                    Response::Opened { repository_id: id }
                }
                Err(err) => error_response(&err),
            }
        }
        Request::Close => {
            if let Some(mut open) = repo.take() {
                if open.is_writable() {
                    if let Err(err) = open.rollback() {
                        warn!("Rollback on close failed: {}", err);
                    }
                }
            }
            Response::Ok
        }
        other => match repo.as_mut() {
            None => Response::Error {
                kind: RemoteErrorKind::Usage,
                message: "no repository open".to_string(),
            },
            Some(repo) => dispatch(repo, other),
        },
    }
}

fn dispatch(repo: &mut Repository, request: Request) -> Response {
    match request {
        Request::Put { id, envelope } => {
            let chunk: Chunk = match rmp_serde::decode::from_read(&envelope[..]) {
                Ok(chunk) => chunk,
                Err(err) => {
                    return Response::Error {
                        kind: RemoteErrorKind::Integrity,
                        message: format!("envelope failed to parse: {}", err),
                    }
                }
            };
            if chunk.get_id() != id {
                return Response::Error {
                    kind: RemoteErrorKind::Integrity,
                    message: "envelope id does not match request".to_string(),
                };
            }
            match repo.put_chunk(&chunk) {
                Ok(_) => Response::Ok,
                Err(err) => error_response(&err),
            }
        }
        Request::Get { id } => match repo.get_chunk(id) {
            Ok(chunk) => match rmp_serde::to_vec(&chunk) {
                Ok(envelope) => Response::Envelope { envelope },
                Err(err) => Response::Error {
                    kind: RemoteErrorKind::Other,
                    message: err.to_string(),
                },
            },
            Err(err) => error_response(&err),
        },
        Request::Delete { id } => match repo.delete(id) {
            Ok(()) => Response::Ok,
            Err(err) => error_response(&err),
        },
        Request::Commit { nonce_high_water } => {
            if let Some(value) = nonce_high_water {
                if let Err(err) = repo.record_nonce_high_water(value) {
                    return error_response(&err);
                }
            }
            match repo.commit() {
                Ok(()) => Response::Ok,
                Err(err) => error_response(&err),
            }
        }
        Request::List => {
            let mut ids: Vec<ChunkId> = repo.list().into_iter().collect();
            ids.sort();
            Response::Ids(ids)
        }
        Request::Check { repair } => {
            let options = CheckOptions {
                repair,
                ..CheckOptions::default()
            };
            match repo.check(&options) {
                Ok(report) => Response::CheckReport {
                    errors: report.errors,
                    complete: report.complete,
                },
                Err(err) => error_response(&err),
            }
        }
        Request::LoadKey => match &repo.config.key {
            Some(wrapped) => match rmp_serde::to_vec(wrapped) {
                Ok(bytes) => Response::Key { wrapped: bytes },
                Err(err) => Response::Error {
                    kind: RemoteErrorKind::Other,
                    message: err.to_string(),
                },
            },
            None => Response::Error {
                kind: RemoteErrorKind::Missing,
                message: "repository embeds no key material".to_string(),
            },
        },
        Request::Open { .. } | Request::Close => unreachable!("handled by the caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::KeyMode;
    use cairn_core::repository::{ChunkSettings, ObjectKind};
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn frames_round_trip() {
        let mut buffer = Vec::new();
        let request = Request::Get {
            id: ChunkId::random_id(),
        };
        write_frame(&mut buffer, &request).unwrap();
        let back: Request = read_frame(&mut Cursor::new(&buffer)).unwrap().unwrap();
        assert_eq!(request, back);

        // Clean EOF after the last frame
        let mut cursor = Cursor::new(&buffer);
        let _: Option<Request> = read_frame(&mut cursor).unwrap();
        let done: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(done.is_none());
    }

    #[test]
    fn oversize_frames_are_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        let result: Result<Option<Request>> = read_frame(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(RpcError::OversizeFrame(_))));
    }

    #[test]
    fn serve_round_trip_against_a_real_repository() {
        let dir = tempdir().unwrap();
        let engine = crate::config::EngineConfig::isolated(&dir.path().join("client"));
        let repo_path = dir.path().join("repo");

        // Initialise the repository and pack a chunk client-side
        let envelope = {
            let mut repo = Repository::init(
                &repo_path,
                &engine,
                KeyMode::Repokey,
                ChunkSettings::lightweight(),
                b"pw",
                true,
            )
            .unwrap();
            let chunk = repo.pack(b"remote object", ObjectKind::Data).unwrap();
            let bytes = rmp_serde::to_vec(&chunk).unwrap();
            (chunk.get_id(), bytes)
        };

        // Script a session: open, put, commit, get, list, close
        let mut session = Vec::new();
        write_frame(
            &mut session,
            &Request::Open {
                path: repo_path.to_string_lossy().into_owned(),
                writable: true,
            },
        )
        .unwrap();
        write_frame(
            &mut session,
            &Request::Put {
                id: envelope.0,
                envelope: envelope.1.clone(),
            },
        )
        .unwrap();
        write_frame(
            &mut session,
            &Request::Commit {
                nonce_high_water: Some(1024),
            },
        )
        .unwrap();
        write_frame(&mut session, &Request::Get { id: envelope.0 }).unwrap();
        write_frame(&mut session, &Request::List).unwrap();
        write_frame(&mut session, &Request::Close).unwrap();

        let mut responses = Vec::new();
        serve(&engine, Cursor::new(session), &mut responses).unwrap();

        let mut cursor = Cursor::new(&responses);
        let opened: Response = read_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(opened, Response::Opened { .. }));
        let put: Response = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(put, Response::Ok);
        let commit: Response = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(commit, Response::Ok);
        let get: Response = read_frame(&mut cursor).unwrap().unwrap();
        match get {
            Response::Envelope { envelope: bytes } => assert_eq!(bytes, envelope.1),
            other => panic!("unexpected response: {:?}", other),
        }
        let list: Response = read_frame(&mut cursor).unwrap().unwrap();
        match list {
            Response::Ids(ids) => assert_eq!(ids, vec![envelope.0]),
            other => panic!("unexpected response: {:?}", other),
        }
        let closed: Response = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(closed, Response::Ok);
    }

    #[test]
    fn requests_before_open_are_usage_errors() {
        let dir = tempdir().unwrap();
        let engine = crate::config::EngineConfig::isolated(dir.path());
        let mut session = Vec::new();
        write_frame(&mut session, &Request::List).unwrap();

        let mut responses = Vec::new();
        serve(&engine, Cursor::new(session), &mut responses).unwrap();
        let response: Response = read_frame(&mut Cursor::new(&responses)).unwrap().unwrap();
        assert!(matches!(
            response,
            Response::Error {
                kind: RemoteErrorKind::Usage,
                ..
            }
        ));
    }
}
