//! Command implementations.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Serialize;

use oxz_core::check::CheckType;
use oxz_core::coder::{Action, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;
use oxz_lzma::LzmaOptions;
use oxz_xz::stream::{StreamDecoder, StreamEncoder};
use oxz_xz::{Filter, stream_list};

/// Check selection on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckArg {
    /// No integrity check.
    None,
    /// CRC-32.
    Crc32,
    /// CRC-64 (default).
    Crc64,
    /// SHA-256.
    Sha256,
}

impl From<CheckArg> for CheckType {
    fn from(arg: CheckArg) -> Self {
        match arg {
            CheckArg::None => CheckType::None,
            CheckArg::Crc32 => CheckType::Crc32,
            CheckArg::Crc64 => CheckType::Crc64,
            CheckArg::Sha256 => CheckType::Sha256,
        }
    }
}

enum Input {
    Stdin(io::Stdin),
    File(BufReader<File>),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stdin(stdin) => stdin.read(buf),
            Self::File(file) => file.read(buf),
        }
    }
}

fn open_input(input: &str) -> Result<Input> {
    Ok(if input == "-" {
        Input::Stdin(io::stdin())
    } else {
        Input::File(BufReader::new(File::open(input)?))
    })
}

fn open_output(path: Option<PathBuf>, from_stdin: bool) -> Result<Box<dyn Write>> {
    match path {
        Some(path) => Ok(Box::new(BufWriter::new(File::create(path)?))),
        None if from_stdin => Ok(Box::new(BufWriter::new(io::stdout()))),
        None => Err(XzError::program("no output destination")),
    }
}

/// Drive a coder from a reader to a writer until the stream ends.
///
/// Returns whether the data was decoded but not verified (unsupported
/// check type in the stream flags).
fn pump(coder: &mut dyn Coder, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<bool> {
    let mut inbuf = vec![0u8; 1 << 16];
    let mut outbuf = vec![0u8; 1 << 16];
    let mut in_len = 0usize;
    let mut in_pos = 0usize;
    let mut eof = false;
    let mut unverified = false;

    loop {
        if in_pos == in_len && !eof {
            in_len = reader.read(&mut inbuf)?;
            in_pos = 0;
            eof = in_len == 0;
        }
        let action = if eof { Action::Finish } else { Action::Run };

        match coder.code(&inbuf[in_pos..in_len], &mut outbuf, action) {
            Ok(status) => {
                in_pos += status.consumed;
                writer.write_all(&outbuf[..status.produced])?;
                if status.ended {
                    writer.flush()?;
                    return Ok(unverified);
                }
                if eof && status.consumed == 0 && status.produced == 0 {
                    return Err(XzError::Buffer);
                }
            }
            Err(XzError::UnsupportedCheck { .. }) => {
                unverified = true;
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn cmd_compress(
    input: &str,
    output: Option<PathBuf>,
    preset: u32,
    check: CheckArg,
    block_size: Option<u64>,
) -> Result<bool> {
    let from_stdin = input == "-";
    let output = output.or_else(|| (!from_stdin).then(|| PathBuf::from(format!("{input}.xz"))));

    let filters = vec![Filter::Lzma2 {
        options: LzmaOptions::preset(preset),
    }];
    let mut encoder = StreamEncoder::new(filters, check.into(), block_size)?;

    let mut reader = open_input(input)?;
    let mut writer = open_output(output, from_stdin)?;
    pump(&mut encoder, &mut reader, &mut writer)
}

fn strip_xz_suffix(input: &str) -> Option<PathBuf> {
    let path = Path::new(input);
    match path.extension() {
        Some(ext) if ext == "xz" => Some(path.with_extension("")),
        _ => None,
    }
}

pub fn cmd_decompress(input: &str, output: Option<PathBuf>, memlimit: Option<u64>) -> Result<bool> {
    let from_stdin = input == "-";
    let output = output.or_else(|| strip_xz_suffix(input));
    if output.is_none() && !from_stdin {
        return Err(XzError::program(
            "cannot derive an output name; use --output",
        ));
    }

    let mut decoder = StreamDecoder::new(true, memlimit.map(MemLimit::new));
    let mut reader = open_input(input)?;
    let mut writer = open_output(output, from_stdin)?;
    pump(&mut decoder, &mut reader, &mut writer)
}

pub fn cmd_test(input: &str, memlimit: Option<u64>) -> Result<bool> {
    let mut decoder = StreamDecoder::new(true, memlimit.map(MemLimit::new));
    let mut reader = open_input(input)?;
    let mut sink = io::sink();
    let unverified = pump(&mut decoder, &mut reader, &mut sink)?;
    if !unverified {
        eprintln!("oxz: {input}: ok");
    }
    Ok(unverified)
}

#[derive(Serialize)]
struct BlockEntry {
    unpadded_size: u64,
    uncompressed_size: u64,
}

#[derive(Serialize)]
struct StreamEntry {
    check: String,
    blocks: Vec<BlockEntry>,
    compressed_size: u64,
    uncompressed_size: u64,
}

fn check_name(check: CheckType) -> String {
    match check {
        CheckType::None => "none".into(),
        CheckType::Crc32 => "crc32".into(),
        CheckType::Crc64 => "crc64".into(),
        CheckType::Sha256 => "sha256".into(),
        CheckType::Unsupported(id) => format!("unknown-{id}"),
    }
}

pub fn cmd_list(input: &Path, json: bool) -> Result<bool> {
    let data = std::fs::read(input)?;
    let streams = stream_list(&data)?;

    if json {
        let entries: Vec<StreamEntry> = streams
            .iter()
            .map(|info| StreamEntry {
                check: check_name(info.check),
                blocks: info
                    .blocks
                    .iter()
                    .map(|b| BlockEntry {
                        unpadded_size: b.unpadded_size,
                        uncompressed_size: b.uncompressed_size,
                    })
                    .collect(),
                compressed_size: info.compressed_size,
                uncompressed_size: info.uncompressed_size,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).expect("serializable")
        );
        return Ok(false);
    }

    println!("{}:", input.display());
    for (i, info) in streams.iter().enumerate() {
        let ratio = if info.uncompressed_size > 0 {
            info.compressed_size as f64 / info.uncompressed_size as f64
        } else {
            1.0
        };
        println!(
            "  stream {}: {} block(s), check {}, {} -> {} bytes (ratio {:.3})",
            i + 1,
            info.blocks.len(),
            check_name(info.check),
            info.uncompressed_size,
            info.compressed_size,
            ratio,
        );
        for (j, block) in info.blocks.iter().enumerate() {
            println!(
                "    block {}: unpadded {} bytes, uncompressed {} bytes",
                j + 1,
                block.unpadded_size,
                block.uncompressed_size,
            );
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_arg_mapping() {
        assert_eq!(CheckType::from(CheckArg::None), CheckType::None);
        assert_eq!(CheckType::from(CheckArg::Sha256), CheckType::Sha256);
    }

    #[test]
    fn test_suffix_stripping() {
        assert_eq!(
            strip_xz_suffix("dir/file.txt.xz"),
            Some(PathBuf::from("dir/file.txt"))
        );
        assert_eq!(strip_xz_suffix("file.gz"), None);
        assert_eq!(strip_xz_suffix("file"), None);
    }

    #[test]
    fn test_pump_roundtrip() {
        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 200) as u8).collect();

        let filters = vec![Filter::Lzma2 {
            options: LzmaOptions {
                dict_size: 1 << 16,
                ..LzmaOptions::preset(1)
            },
        }];
        let mut encoder = StreamEncoder::new(filters, CheckType::Crc64, None).unwrap();
        let mut compressed = Vec::new();
        pump(&mut encoder, &mut &data[..], &mut compressed).unwrap();

        let mut decoder = StreamDecoder::new(true, None);
        let mut decoded = Vec::new();
        let unverified = pump(&mut decoder, &mut &compressed[..], &mut decoded).unwrap();
        assert!(!unverified);
        assert_eq!(decoded, data);
    }
}
