//! Just enough tar to append and scan members.
//!
//! The index only cares that each member has header blocks of known size
//! and a 512-byte-padded body at a known offset; everything else about
//! the format is left to real tar tools. Headers are written in the GNU
//! flavor, with an `L` long-name entry ahead of members whose name does
//! not fit the 100-byte header field.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::{block::MemberRecord, Error};

/// Tar block (and header) size.
pub(crate) const BLOCK: usize = 512;

/// Widest name the plain header field holds.
const NAME_FIELD: usize = 100;

const GNU_MAGIC: &[u8; 8] = b"ustar  \0";

/// Placeholder name carried by GNU `L` entries.
const LONG_NAME_HEADER: &str = "././@LongLink";

/// Anything larger than this in an `L` entry is garbage, not a name.
const LONG_NAME_LIMIT: u64 = 4096;

const REGULAR: u8 = b'0';
const LONG_NAME: u8 = b'L';

fn write_octal(field: &mut [u8], value: u64) {
    let digits = format!("{value:0width$o}", width = field.len() - 1);
    field[..digits.len()].copy_from_slice(digits.as_bytes());
    field[digits.len()] = 0;
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 8).ok()
}

fn encode_header(name: &[u8], size: u64, mtime: u64, typeflag: u8) -> [u8; BLOCK] {
    let mut header = [0u8; BLOCK];
    header[..name.len()].copy_from_slice(name);
    write_octal(&mut header[100..108], 0o644); // mode
    write_octal(&mut header[108..116], 0); // uid
    write_octal(&mut header[116..124], 0); // gid
    write_octal(&mut header[124..136], size);
    write_octal(&mut header[136..148], mtime);
    header[156] = typeflag;
    header[257..265].copy_from_slice(GNU_MAGIC);

    header[148..156].copy_from_slice(b"        ");
    let sum: u32 = header.iter().map(|byte| *byte as u32).sum();
    let checksum = format!("{sum:06o}\0 ");
    header[148..156].copy_from_slice(checksum.as_bytes());
    header
}

fn checksum_matches(header: &[u8; BLOCK]) -> bool {
    let Some(stored) = parse_octal(&header[148..156]) else {
        return false;
    };
    let sum: u64 = header
        .iter()
        .enumerate()
        .map(|(index, byte)| {
            if (148..156).contains(&index) {
                b' ' as u64
            } else {
                *byte as u64
            }
        })
        .sum();
    sum == stored
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK as u64) * BLOCK as u64
}

/// Header blocks for one member: an optional GNU long-name entry
/// followed by the member header. The payload starts right after the
/// returned bytes.
pub(crate) fn encode_member_header(name: &str, size: u64, mtime: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK);
    let name_bytes = name.as_bytes();
    if name_bytes.len() > NAME_FIELD {
        let mut data = name_bytes.to_vec();
        data.push(0);
        out.extend_from_slice(&encode_header(
            LONG_NAME_HEADER.as_bytes(),
            data.len() as u64,
            0,
            LONG_NAME,
        ));
        out.extend_from_slice(&data);
        out.resize(padded(out.len() as u64) as usize, 0);
        out.extend_from_slice(&encode_header(
            &name_bytes[..NAME_FIELD],
            size,
            mtime,
            REGULAR,
        ));
    } else {
        out.extend_from_slice(&encode_header(name_bytes, size, mtime, REGULAR));
    }
    out
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Sequential scan over an archive, yielding one record per member with
/// the payload offset already resolved.
///
/// The tail of an archive whose writer died mid-append is tolerated: a
/// short read, an all-zero block, a checksum mismatch or an unparsable
/// header all end the scan cleanly.
pub(crate) struct Scanner<R> {
    reader: R,
    position: u64,
}

impl<R> Scanner<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    /// The next member, or `None` at (possibly torn) end of archive.
    pub(crate) async fn next_member(&mut self) -> Result<Option<MemberRecord>, Error> {
        let mut long_name: Option<String> = None;
        loop {
            let mut header = [0u8; BLOCK];
            match self.reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(error) => return Err(error.into()),
            }
            self.position += BLOCK as u64;

            if header.iter().all(|byte| *byte == 0) {
                // end-of-archive marker
                return Ok(None);
            }
            if !checksum_matches(&header) {
                return Ok(None);
            }
            let Some(size) = parse_octal(&header[124..136]) else {
                return Ok(None);
            };

            match header[156] {
                LONG_NAME => {
                    if size == 0 || size > LONG_NAME_LIMIT {
                        return Ok(None);
                    }
                    let mut data = vec![0u8; size as usize];
                    match self.reader.read_exact(&mut data).await {
                        Ok(_) => {}
                        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Ok(None)
                        }
                        Err(error) => return Err(error.into()),
                    }
                    let Ok(name) = std::str::from_utf8(trim_nul(&data)) else {
                        return Ok(None);
                    };
                    long_name = Some(name.to_owned());
                    self.skip(padded(size) - size).await?;
                }
                REGULAR | 0 => {
                    let name = match long_name.take() {
                        Some(name) => name,
                        None => {
                            let Ok(name) = std::str::from_utf8(trim_nul(&header[..NAME_FIELD]))
                            else {
                                return Ok(None);
                            };
                            let prefix = trim_nul(&header[345..500]);
                            if prefix.is_empty() {
                                name.to_owned()
                            } else {
                                let Ok(prefix) = std::str::from_utf8(prefix) else {
                                    return Ok(None);
                                };
                                format!("{prefix}/{name}")
                            }
                        }
                    };
                    let offset = self.position;
                    self.skip(padded(size)).await?;
                    return Ok(Some(MemberRecord::new(name, offset, size)));
                }
                _ => {
                    // pax headers, links, devices: not members, skip the
                    // payload and forget any pending long name
                    long_name = None;
                    self.skip(padded(size)).await?;
                }
            }
        }
    }

    async fn skip(&mut self, bytes: u64) -> Result<(), Error> {
        if bytes > 0 {
            self.reader
                .seek(std::io::SeekFrom::Current(bytes as i64))
                .await?;
        }
        self.position += bytes;
        Ok(())
    }
}
