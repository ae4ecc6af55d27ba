// Copyright 2024 Oxide Computer Company
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use slog::{info, o, Logger};
use uuid::Uuid;

use incfs_common::*;
use incfs_datafile::*;

#[derive(Debug, Parser)]
#[clap(about = "inspect and drive incremental backing files")]
struct Opt {
    /// Mount options file (TOML)
    #[clap(long, global = true, name = "CONFIG", action)]
    config: Option<PathBuf>,

    /// One of critical, error, warning, info, debug, trace
    #[clap(long, global = true, default_value = "info", action)]
    log_level: String,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Parser)]
enum Cmd {
    /// Lay out an empty backing file sized for an image
    Create {
        #[clap(short, long, name = "BACKING", action)]
        backing: PathBuf,

        #[clap(short, long, name = "IMAGE", action)]
        image: PathBuf,

        /// Reserve and describe a SHA-256 hash tree over the image
        #[clap(long, action)]
        hash_tree: bool,

        /*
         * Opaque signature bytes stored next to the root hash.
         */
        #[clap(long, name = "SIGNATURE_FILE", requires = "hash_tree", action)]
        signature: Option<PathBuf>,

        #[clap(long, action)]
        attribute: Option<String>,

        #[clap(short, long, name = "UUID", action)]
        uuid: Option<Uuid>,
    },
    /// Fill data blocks (and optionally hash blocks) from an image
    Fill {
        #[clap(short, long, name = "BACKING", action)]
        backing: PathBuf,

        #[clap(short, long, name = "IMAGE", action)]
        image: PathBuf,

        /// Only these blocks; all blocks when omitted
        #[clap(long = "block", name = "INDEX", action)]
        blocks: Vec<u32>,

        /// Store blocks LZ4 compressed when that saves space
        #[clap(long, action)]
        lz4: bool,

        /// Also fill the hash tree blocks
        #[clap(long, action)]
        hashes: bool,
    },
    /// Read and verify one block
    Read {
        #[clap(short, long, name = "BACKING", action)]
        backing: PathBuf,

        #[clap(long, action)]
        block: u32,

        /// Defaults to the mount's read_timeout_ms
        #[clap(long, action)]
        timeout_ms: Option<u32>,

        /// Write the block here instead of printing a hex preview
        #[clap(short, long, name = "OUT_FILE", action)]
        output: Option<PathBuf>,

        /// Print the read log afterwards
        #[clap(long, action)]
        dump_log: bool,
    },
    /// List present block ranges
    Filled {
        #[clap(short, long, name = "BACKING", action)]
        backing: PathBuf,

        #[clap(long, default_value = "0", action)]
        start: u32,

        /// Zero means the end of the file
        #[clap(long, default_value = "0", action)]
        end: u32,

        /// Ranges fetched per query
        #[clap(long, default_value = "64", action)]
        max_ranges: usize,
    },
    /// Show header, counts, and flags
    Info {
        #[clap(short, long, name = "BACKING", action)]
        backing: PathBuf,

        /// Also write the report as JSON to this file
        #[clap(long, name = "JSON_FILE", action)]
        json: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct FileInfo {
    file_id: FileId,
    size: u64,
    data_blocks: u32,
    total_blocks: u32,
    flags: u32,
    complete: bool,
    hash_tree_depth: Option<usize>,
    signature: String,
    attribute: Option<String>,
}

fn open(mount: &Arc<MountState>, backing: &Path) -> Result<DataFile> {
    let raw = RawBackingFile::open(backing)?;
    DataFile::open(mount, Box::new(raw))
        .with_context(|| anyhow!("open {:?}", backing))
}

fn create(
    log: &Logger,
    backing: &Path,
    image: &Path,
    hash_tree: bool,
    signature: Option<&Path>,
    attribute: Option<String>,
    uuid: Option<Uuid>,
) -> Result<FileId> {
    let data =
        std::fs::read(image).with_context(|| anyhow!("read {:?}", image))?;
    let signature = if hash_tree {
        let (_, root) = build_hash_tree(HashAlgorithm::Sha256, &data)?;
        let sig_bytes = match signature {
            Some(p) => std::fs::read(p)?,
            None => Vec::new(),
        };
        Some(Signature::new(HashAlgorithm::Sha256, root, sig_bytes).to_bytes()?)
    } else {
        None
    };

    let file_id = uuid.map(FileId).unwrap_or_else(FileId::new_v4);
    mkdir_for_file(backing)?;
    RawBackingFile::create(
        backing,
        &NewFile {
            file_id,
            size: data.len() as u64,
            signature,
            attribute: attribute.map(String::into_bytes),
        },
    )?;
    info!(log, "created {:?}", backing; "file" => %file_id, "size" => data.len());
    Ok(file_id)
}

fn fill(
    mount: &Arc<MountState>,
    backing: &Path,
    image: &Path,
    blocks: &[u32],
    lz4: bool,
    hashes: bool,
) -> Result<usize> {
    let df = open(mount, backing)?;
    let data =
        std::fs::read(image).with_context(|| anyhow!("read {:?}", image))?;
    if data.len() as u64 != df.size() {
        bail!("image is {} bytes, file is {}", data.len(), df.size());
    }

    let chunks: Vec<&[u8]> = data.chunks(DATA_FILE_BLOCK_SIZE).collect();
    let indexes: Vec<u32> = if blocks.is_empty() {
        (0..df.data_block_count()).collect()
    } else {
        blocks.to_vec()
    };

    let mut payloads = Vec::with_capacity(indexes.len());
    for i in &indexes {
        let chunk = chunks
            .get(*i as usize)
            .ok_or_else(|| anyhow!("block {} is past the end", i))?;
        let packed = if lz4 {
            Some(lz4_flex::block::compress(chunk))
        } else {
            None
        };
        payloads.push(match packed {
            Some(p) if p.len() < chunk.len() => (p, Compression::Lz4),
            _ => (chunk.to_vec(), Compression::None),
        });
    }

    let area = if hashes {
        if df.hash_tree().is_none() {
            bail!("{:?} has no hash tree", backing);
        }
        build_hash_tree(HashAlgorithm::Sha256, &data)?.0
    } else {
        Vec::new()
    };

    let mut fills: Vec<FillBlock> = indexes
        .iter()
        .zip(&payloads)
        .map(|(i, (payload, compression))| FillBlock {
            block_index: *i,
            kind: BlockKind::Data,
            compression: *compression,
            data: payload.as_slice(),
        })
        .collect();

    fills.extend(area.chunks(DATA_FILE_BLOCK_SIZE).enumerate().map(
        |(i, chunk)| FillBlock {
            block_index: i as u32,
            kind: BlockKind::Hash,
            compression: Compression::None,
            data: chunk,
        },
    ));

    let filled = df.fill_blocks(&fills)?;
    if filled != fills.len() {
        bail!("only {} of {} blocks filled", filled, fills.len());
    }
    Ok(filled)
}

fn read(
    mount: &Arc<MountState>,
    backing: &Path,
    block: u32,
    timeout_ms: Option<u32>,
    output: Option<&Path>,
    dump_log: bool,
) -> Result<Vec<u8>> {
    let df = open(mount, backing)?;
    let timeout_ms = timeout_ms.unwrap_or(mount.options().read_timeout_ms);
    let mut dst = vec![0u8; DATA_FILE_BLOCK_SIZE];
    let mut scratch = vec![0u8; 2 * DATA_FILE_BLOCK_SIZE];
    let mut cursor = mount.read_log().state();

    let res = df.read_block(block, timeout_ms, &mut dst, &mut scratch, None);

    if dump_log {
        for r in mount.collect_logged_reads(&mut cursor, usize::MAX) {
            println!(
                "log #{} file {} block {} at {}us",
                r.serial_number, r.file_id, r.block_index, r.timestamp_us
            );
        }
    }

    let n = res.with_context(|| anyhow!("read block {}", block))?;
    dst.truncate(n);
    match output {
        Some(p) => std::fs::write(p, &dst)?,
        None => println!("{}", hex::encode(&dst[..dst.len().min(64)])),
    }
    Ok(dst)
}

fn filled(
    mount: &Arc<MountState>,
    backing: &Path,
    start: u32,
    end: u32,
    max_ranges: usize,
) -> Result<Vec<FilledRange>> {
    let df = open(mount, backing)?;
    let end = if end == 0 { df.total_block_count() } else { end };
    let mut ranges = Vec::new();
    let mut next = start;
    while next < end {
        let got = df.get_filled_blocks(&GetFilledBlocksArgs {
            start_index: next,
            end_index: end,
            max_ranges,
        })?;
        ranges.extend(got.ranges);
        if got.index_out <= next {
            break;
        }
        next = got.index_out;
    }
    Ok(ranges)
}

fn file_info(mount: &Arc<MountState>, backing: &Path) -> Result<FileInfo> {
    let df = open(mount, backing)?;
    Ok(FileInfo {
        file_id: df.id(),
        size: df.size(),
        data_blocks: df.data_block_count(),
        total_blocks: df.total_block_count(),
        flags: df.header_flags(),
        complete: df.is_complete(),
        hash_tree_depth: df.hash_tree().map(|t| t.depth),
        signature: hex::encode(df.read_signature()?),
        attribute: df
            .read_attribute()?
            .map(|a| String::from_utf8_lossy(&a).into_owned()),
    })
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let level = opt
        .log_level
        .parse::<slog::Level>()
        .map_err(|_| anyhow!("unknown log level {:?}", opt.log_level))?;
    let log = build_logger_with_level(level).new(o!("task" => "incfsctl"));

    let options = match &opt.config {
        Some(p) => MountOptions::from_toml_file(p)?,
        None => MountOptions::default(),
    };
    let mount = MountState::new(options, &log)?;

    match opt.cmd {
        Cmd::Create {
            backing,
            image,
            hash_tree,
            signature,
            attribute,
            uuid,
        } => {
            let id = create(
                &log,
                &backing,
                &image,
                hash_tree,
                signature.as_deref(),
                attribute,
                uuid,
            )?;
            println!("{}", id);
        }
        Cmd::Fill {
            backing,
            image,
            blocks,
            lz4,
            hashes,
        } => {
            let n = fill(&mount, &backing, &image, &blocks, lz4, hashes)?;
            println!("filled {} blocks", n);
        }
        Cmd::Read {
            backing,
            block,
            timeout_ms,
            output,
            dump_log,
        } => {
            read(&mount, &backing, block, timeout_ms, output.as_deref(), dump_log)?;
        }
        Cmd::Filled {
            backing,
            start,
            end,
            max_ranges,
        } => {
            for r in filled(&mount, &backing, start, end, max_ranges)? {
                println!("[{}, {})", r.begin, r.end);
            }
        }
        Cmd::Info { backing, json } => {
            let info = file_info(&mount, &backing)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            if let Some(p) = json {
                mkdir_for_file(&p)?;
                write_json(&p, &info, true)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn csl() -> Logger {
        build_logger()
    }

    fn image(blocks: usize) -> Vec<u8> {
        (0..blocks * 4096 - 100).map(|i| (i % 199) as u8).collect()
    }

    #[test]
    fn create_fill_read_round() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image_path = dir.path().join("image");
        let data = image(140);
        std::fs::write(&image_path, &data)?;
        let backing = dir.path().join("nested").join("backing");

        let log = csl();
        let id = create(
            &log,
            &backing,
            &image_path,
            true,
            None,
            Some("v=1".to_string()),
            None,
        )?;
        let mount = MountState::new(MountOptions::default(), &log)?;

        let info = file_info(&mount, &backing)?;
        assert_eq!(info.file_id, id);
        assert_eq!(info.data_blocks, 140);
        assert_eq!(info.hash_tree_depth, Some(2));
        assert_eq!(info.attribute.as_deref(), Some("v=1"));

        fill(&mount, &backing, &image_path, &[0, 139], true, true)?;
        assert_eq!(
            filled(&mount, &backing, 0, 0, 1)?,
            vec![
                FilledRange { begin: 0, end: 1 },
                FilledRange { begin: 139, end: 143 },
            ]
        );

        let last = read(&mount, &backing, 139, Some(0), None, false)?;
        assert_eq!(last, data[139 * 4096..].to_vec());
        assert!(read(&mount, &backing, 5, Some(0), None, false).is_err());
        Ok(())
    }

    #[test]
    fn info_json_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image_path = dir.path().join("image");
        std::fs::write(&image_path, image(2))?;
        let backing = dir.path().join("backing");
        create(&csl(), &backing, &image_path, false, None, None, None)?;

        let mount = MountState::new(MountOptions::default(), &csl())?;
        let info = file_info(&mount, &backing)?;
        let out = dir.path().join("info.json");
        write_json(&out, &info, false)?;
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&out)?)?;
        assert_eq!(v["data_blocks"], 2);
        assert_eq!(v["complete"], false);
        Ok(())
    }
}
