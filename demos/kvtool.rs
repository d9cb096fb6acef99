//! Offline tool for inspecting and editing store images kept in files.
//!
//! Set `RUST_LOG=sectorkv=debug` to watch what the store does.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use sectorkv::low_level::{self, CleaningHeader, ERASED_BYTE};
use sectorkv::{EraseError, Flash, Geometry, Store, MAX_KEY_LENGTH};
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Kvtool {
    /// Sector (erase block) size of the image, in bytes.
    #[clap(short, long, default_value_t = 4096)]
    sector_size: u32,

    /// Write granularity to enforce, in bytes.
    #[clap(short, long, default_value_t = 4)]
    alignment: u32,

    #[clap(subcommand)]
    cmd: Cmd,

    image_file: PathBuf,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a new, fully erased image.
    Create {
        #[clap(short = 'n', long, default_value_t = 4)]
        sectors: u32,
    },
    /// Enables a store on the image and reports its state.
    Check,
    Put {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    Erase {
        key: String,
    },
    List,
    /// Prints every sector and chunk, including superseded ones.
    Dump,
    /// Runs a full garbage collection.
    Gc,
}

type ImageStore = Store<FlashImage, 256, 256>;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sectorkv=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Kvtool::parse();
    let open = || {
        FlashImage::open(&args.image_file, args.sector_size, args.alignment)
            .with_context(|| {
                format!("opening image file {}", args.image_file.display())
            })
    };

    match &args.cmd {
        Cmd::Create { sectors } => {
            create_image(&args.image_file, args.sector_size, *sectors)?;
            println!("created {sectors} sectors of {} bytes", args.sector_size);
        }
        Cmd::Check => {
            let store = with_enabled_image(open()?)?;
            let g = Geometry::of(store.flash());
            let stats = store.stats();
            println!("geometry: {} sectors of {} bytes, alignment {}",
                g.sector_count, g.sector_size, g.alignment);
            println!("- {} keys, {} tombstones", stats.keys, stats.tombstones);
            println!("- {} empty sectors, {} pending cleaning",
                stats.empty_sectors, stats.pending_sectors);
            println!("- {} bytes free", stats.bytes_remaining);
        }
        Cmd::Put { key, value } => {
            let mut store = with_enabled_image(open()?)?;
            match store.put(key.as_bytes(), value.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(sectorkv::Error::ResourceExhausted) => println!("no space"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Get { key } => {
            let store = with_enabled_image(open()?)?;
            let len = match store.get_value_size(key.as_bytes()) {
                Ok(len) => len,
                Err(sectorkv::Error::NotFound) => {
                    println!("not found");
                    return Ok(());
                }
                Err(e) => bail!("looking up key: {e:?}"),
            };
            let mut out = vec![0; usize::from(len)];
            store.get(key.as_bytes(), 0, &mut out)
                .map_err(|e| anyhow!("reading value: {e:?}"))?;
            println!("{}", pretty_hex::pretty_hex(&out));
        }
        Cmd::Erase { key } => {
            let mut store = with_enabled_image(open()?)?;
            match store.erase(key.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(sectorkv::Error::NotFound) => println!("not found"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::List => {
            let store = with_enabled_image(open()?)?;
            for (key, len) in store.iter() {
                println!("{key:?}: {len} bytes");
            }
        }
        Cmd::Dump => dump(&open()?)?,
        Cmd::Gc => {
            let mut store = with_enabled_image(open()?)?;
            let before = store.stats().bytes_remaining;
            store.garbage_collect()
                .map_err(|e| anyhow!("garbage collection failed: {e:?}"))?;
            println!("reclaimed {} bytes",
                store.stats().bytes_remaining.saturating_sub(before));
        }
    }

    Ok(())
}

fn create_image(path: &Path, sector_size: u32, sectors: u32) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let erased = vec![ERASED_BYTE; sector_size as usize];
    for _ in 0..sectors {
        file.write_all(&erased)?;
    }
    Ok(())
}

fn with_enabled_image(img: FlashImage) -> anyhow::Result<ImageStore> {
    let mut store = ImageStore::new(img);
    if let Err(e) = store.enable() {
        bail!("could not enable store: {e:?}");
    }
    Ok(store)
}

/// Walks the image with the low-level readers, without building an index.
fn dump(img: &FlashImage) -> anyhow::Result<()> {
    let g = Geometry::of(img);
    if !g.is_valid() {
        bail!("image geometry {g:?} is unusable");
    }

    let mut buffer = [0u8; 256];
    for sector in 0..g.sector_count {
        let header = match low_level::read_sector_header(img, &g, sector)? {
            Some(header) => header,
            None => {
                println!("sector {sector}: not initialized");
                continue;
            }
        };
        println!("sector {sector}: version {}, alignment {}",
            header.version, header.alignment);

        let clean_order = low_level::read_clean_order(img, &g, sector)?;
        if clean_order != CleaningHeader::NOT_PENDING {
            println!("- pending cleaning, order {clean_order}");
        }

        let base = g.sector_base(sector);
        let mut offset = g.chunk_start();
        while offset + g.chunk_header_len() <= g.sector_size {
            let address = base + offset;
            let chunk = match low_level::read_chunk_header(img, address)? {
                Some(chunk) => chunk,
                None => break,
            };
            let value_len = usize::from(chunk.value_len.get());
            let len = g.chunk_len(usize::from(chunk.key_len.get()), value_len);
            if offset + len > g.sector_size {
                println!("- chunk at {address:#x} overruns the sector");
                break;
            }

            let crc = low_level::checksum_on_flash(img, &g, address, &chunk, &mut buffer)?;
            println!("- chunk at {address:#x}, {len} bytes{}{}",
                if chunk.is_tombstone() { ", tombstone" } else { "" },
                if crc != chunk.crc.get() { ", BAD CHECKSUM" } else { "" });

            let mut raw = [0; MAX_KEY_LENGTH];
            let key = low_level::read_key(img, &g, address, &chunk, &mut raw)?;
            println!("Key {}", pretty_hex::pretty_hex(&key));
            if !chunk.is_tombstone() {
                let mut value = vec![0; value_len];
                img.read(g.value_address(address, key.len()), &mut value)?;
                println!("Value {}", pretty_hex::pretty_hex(&value));
            }

            offset += len;
        }

        let tail = g.sector_size - offset;
        if tail > 0 && !img.is_erased(base + offset, tail)? {
            println!("- NOT ERASED after offset {offset:#x}");
        }
        println!();
    }
    Ok(())
}

/// A store image held in a file. Writes don't emulate NOR programming, they
/// just overwrite.
struct FlashImage {
    file: RefCell<std::fs::File>,
    sector_size: u32,
    sector_count: u32,
    alignment: u32,
}

impl FlashImage {
    fn open(
        path: impl AsRef<Path>,
        sector_size: u32,
        alignment: u32,
    ) -> Result<Self, anyhow::Error> {
        if sector_size == 0 {
            bail!("sector size must be nonzero");
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len % u64::from(sector_size) != 0 {
            bail!("file is not a whole number of sectors in length");
        }
        let sector_count = u32::try_from(file_len / u64::from(sector_size))
            .context("file too large")?;

        Ok(Self {
            file: file.into(),
            sector_size,
            sector_count,
            alignment,
        })
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }

    fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(address)))?;
        file.read_exact(dest)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(u64::from(address)))?;
        file.write_all(data)
    }

    fn erase(&mut self, index: u32, count: u32) -> Result<(), EraseError<Self::Error>> {
        let erased = vec![ERASED_BYTE; self.sector_size as usize];
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(u64::from(index) * u64::from(self.sector_size)))?;
        for _ in 0..count {
            file.write_all(&erased)?;
        }
        Ok(())
    }
}
