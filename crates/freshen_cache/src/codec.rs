//! Serializer pairs that turn results into payload files and back.
//!
//! The cache store only decides *where* a payload lives and whether it is
//! valid; the bytes themselves belong to a codec. Scalar results use a
//! [`ScalarCodec`]; sequence results use a [`SequenceCodec`], whose writer is
//! fed one item at a time so a sequence can be recorded while it is consumed.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Lazily decoded items read back from a sequence payload.
pub type ItemStream<T> = Box<dyn Iterator<Item = Result<T, CodecError>>>;

/// Writes and reads a single result value.
pub trait ScalarCodec<T> {
    /// Writes `value` to `location`, replacing any existing file.
    fn write(&self, value: &T, location: &Path) -> Result<(), CodecError>;

    /// Reads a value previously written to `location`.
    fn read(&self, location: &Path) -> Result<T, CodecError>;
}

/// Incremental writer for one sequence payload.
pub trait ItemWriter<T> {
    /// Appends one item after all previously pushed items.
    fn push(&mut self, item: &T) -> Result<(), CodecError>;

    /// Flushes everything to disk. Items pushed after a failed `push` are
    /// not guaranteed to be readable.
    fn finish(self) -> Result<(), CodecError>;
}

/// Writes and reads an ordered sequence of items.
pub trait SequenceCodec<T> {
    /// Writer type returned by [`SequenceCodec::writer`].
    type Writer: ItemWriter<T>;

    /// Opens a writer that creates (or truncates) `location`.
    fn writer(&self, location: &Path) -> Result<Self::Writer, CodecError>;

    /// Opens `location` and returns its items lazily, in write order.
    fn read(&self, location: &Path) -> Result<ItemStream<T>, CodecError>;

    /// Writes a whole sequence in one pass.
    fn write_all<I>(&self, items: I, location: &Path) -> Result<(), CodecError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut writer = self.writer(location)?;
        for item in items {
            writer.push(&item)?;
        }
        writer.finish()
    }
}

// ---------------------------------------------------------------------------
// Bincode (default)
// ---------------------------------------------------------------------------

/// Default codec: bincode with the standard configuration.
///
/// Sequence payloads are a series of frames, each a little-endian `u32`
/// length followed by one encoded item.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T: Serialize + DeserializeOwned> ScalarCodec<T> for BincodeCodec {
    fn write(&self, value: &T, location: &Path) -> Result<(), CodecError> {
        let mut out = create(location)?;
        bincode::serde::encode_into_std_write(value, &mut out, bincode::config::standard())
            .map_err(|e| encode_error(e, location))?;
        close(out, location)
    }

    fn read(&self, location: &Path) -> Result<T, CodecError> {
        let mut input = open(location)?;
        bincode::serde::decode_from_std_read(&mut input, bincode::config::standard()).map_err(
            |e| CodecError::Decode {
                path: location.to_path_buf(),
                reason: e.to_string(),
            },
        )
    }
}

impl<T: Serialize + DeserializeOwned + 'static> SequenceCodec<T> for BincodeCodec {
    type Writer = BincodeItemWriter;

    fn writer(&self, location: &Path) -> Result<Self::Writer, CodecError> {
        Ok(BincodeItemWriter {
            out: create(location)?,
            path: location.to_path_buf(),
        })
    }

    fn read(&self, location: &Path) -> Result<ItemStream<T>, CodecError> {
        Ok(Box::new(BincodeItems {
            input: open(location)?,
            path: location.to_path_buf(),
            done: false,
            _item: PhantomData,
        }))
    }
}

/// Frame writer for [`BincodeCodec`] sequences.
pub struct BincodeItemWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl<T: Serialize> ItemWriter<T> for BincodeItemWriter {
    fn push(&mut self, item: &T) -> Result<(), CodecError> {
        let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(|e| encode_error(e, &self.path))?;
        let len = u32::try_from(bytes.len()).map_err(|_| CodecError::Encode {
            reason: format!("item of {} bytes exceeds the frame limit", bytes.len()),
        })?;
        self.out
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.out.write_all(&bytes))
            .map_err(CodecError::io(&self.path))
    }

    fn finish(self) -> Result<(), CodecError> {
        close(self.out, &self.path)
    }
}

struct BincodeItems<T> {
    input: BufReader<File>,
    path: PathBuf,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for BincodeItems<T> {
    type Item = Result<T, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = match read_frame(&mut self.input) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(CodecError::Io {
                    path: self.path.clone(),
                    source: e,
                }));
            }
        };
        let decoded = bincode::serde::decode_from_slice(&frame, bincode::config::standard())
            .map(|(item, _)| item)
            .map_err(|e| CodecError::Decode {
                path: self.path.clone(),
                reason: e.to_string(),
            });
        if decoded.is_err() {
            self.done = true;
        }
        Some(decoded)
    }
}

/// Reads one length-prefixed frame. `Ok(None)` means a clean end of file.
fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let mut frame = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    reader.read_exact(&mut frame)?;
    Ok(Some(frame))
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Human-readable codec: one JSON document for scalars, JSON Lines for
/// sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> ScalarCodec<T> for JsonCodec {
    fn write(&self, value: &T, location: &Path) -> Result<(), CodecError> {
        let mut out = create(location)?;
        serde_json::to_writer(&mut out, value).map_err(|e| json_write_error(e, location))?;
        close(out, location)
    }

    fn read(&self, location: &Path) -> Result<T, CodecError> {
        serde_json::from_reader(open(location)?).map_err(|e| CodecError::Decode {
            path: location.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl<T: Serialize + DeserializeOwned + 'static> SequenceCodec<T> for JsonCodec {
    type Writer = JsonLinesWriter;

    fn writer(&self, location: &Path) -> Result<Self::Writer, CodecError> {
        Ok(JsonLinesWriter {
            out: create(location)?,
            path: location.to_path_buf(),
        })
    }

    fn read(&self, location: &Path) -> Result<ItemStream<T>, CodecError> {
        let path = location.to_path_buf();
        let lines = open(location)?.lines();
        Ok(Box::new(
            lines
                .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
                .map(move |line| {
                    let line = line.map_err(CodecError::io(&path))?;
                    serde_json::from_str(&line).map_err(|e| CodecError::Decode {
                        path: path.clone(),
                        reason: e.to_string(),
                    })
                }),
        ))
    }
}

/// JSON Lines writer for [`JsonCodec`] sequences.
pub struct JsonLinesWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl<T: Serialize> ItemWriter<T> for JsonLinesWriter {
    fn push(&mut self, item: &T) -> Result<(), CodecError> {
        serde_json::to_writer(&mut self.out, item).map_err(|e| json_write_error(e, &self.path))?;
        self.out.write_all(b"\n").map_err(CodecError::io(&self.path))
    }

    fn finish(self) -> Result<(), CodecError> {
        close(self.out, &self.path)
    }
}

// ---------------------------------------------------------------------------
// Closures
// ---------------------------------------------------------------------------

/// Scalar codec built from a pair of functions.
///
/// ```ignore
/// let codec = FnCodec::new(
///     |value: &String, path: &Path| std::fs::write(path, value).map_err(CodecError::from_io(path)),
///     |path: &Path| std::fs::read_to_string(path).map_err(CodecError::from_io(path)),
/// );
/// ```
#[derive(Clone)]
pub struct FnCodec<W, R> {
    write: W,
    read: R,
}

impl<W, R> FnCodec<W, R> {
    /// Pairs a write function with a read function.
    pub fn new(write: W, read: R) -> Self {
        Self { write, read }
    }
}

impl<T, W, R> ScalarCodec<T> for FnCodec<W, R>
where
    W: Fn(&T, &Path) -> Result<(), CodecError>,
    R: Fn(&Path) -> Result<T, CodecError>,
{
    fn write(&self, value: &T, location: &Path) -> Result<(), CodecError> {
        (self.write)(value, location)
    }

    fn read(&self, location: &Path) -> Result<T, CodecError> {
        (self.read)(location)
    }
}

impl CodecError {
    /// Adapts an I/O error at `path`, for use in custom codecs.
    pub fn from_io(path: &Path) -> impl FnOnce(std::io::Error) -> CodecError + '_ {
        move |source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn create(location: &Path) -> Result<BufWriter<File>, CodecError> {
    File::create(location)
        .map(BufWriter::new)
        .map_err(CodecError::io(location))
}

fn open(location: &Path) -> Result<BufReader<File>, CodecError> {
    File::open(location)
        .map(BufReader::new)
        .map_err(CodecError::io(location))
}

fn close(out: BufWriter<File>, location: &Path) -> Result<(), CodecError> {
    let file = out
        .into_inner()
        .map_err(|e| CodecError::Io {
            path: location.to_path_buf(),
            source: e.into_error(),
        })?;
    file.sync_all().map_err(CodecError::io(location))
}

fn encode_error(err: bincode::error::EncodeError, location: &Path) -> CodecError {
    match err {
        bincode::error::EncodeError::Io { inner, .. } => CodecError::Io {
            path: location.to_path_buf(),
            source: inner,
        },
        other => CodecError::Encode {
            reason: other.to_string(),
        },
    }
}

fn json_write_error(err: serde_json::Error, location: &Path) -> CodecError {
    if err.is_io() {
        CodecError::Io {
            path: location.to_path_buf(),
            source: err.into(),
        }
    } else {
        CodecError::Encode {
            reason: err.to_string(),
        }
    }
}
