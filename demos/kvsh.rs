//! Interactive shell over a store on simulated flash held in RAM.
//!
//! `reboot` drops the in-memory index and rescans the flash. `tear N` lets N
//! more flash writes land and fails every one after that, as if power had
//! been cut; `reboot` to recover.

use clap::Parser;
use rustyline::error::ReadlineError;
use sectorkv::low_level::ERASED_BYTE;
use sectorkv::{EraseError, Flash, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Kvsh {
    #[clap(short, long, default_value_t = 512)]
    sector_size: u32,

    #[clap(short = 'n', long, default_value_t = 4)]
    sectors: u32,

    #[clap(short, long, default_value_t = 4)]
    alignment: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sectorkv=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Kvsh::parse();
    let flash = RamFlash::new(args.sector_size, args.sectors, args.alignment);
    let mut store: Store<RamFlash> = Store::new(flash);
    if let Err(e) = store.enable() {
        println!("enable failed: {e:?}");
    }

    let mut rl = rustyline::Editor::<()>::new()?;

    loop {
        match rl.readline(">> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str());
                store = run(store, &line);
            }
            Err(ReadlineError::Eof) => {
                println!("exiting.");
                break;
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Io(e)) => return Err(e.into()),
            Err(e) => {
                println!("unexpected error: {e:?}");
                break;
            }
        }
    }

    Ok(())
}

fn run(mut store: Store<RamFlash>, line: &str) -> Store<RamFlash> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => (),
        ["put", key, value] => match store.put(key.as_bytes(), value.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(e) => println!("error: {e:?}"),
        },
        ["get", key] => {
            let len = match store.get_value_size(key.as_bytes()) {
                Ok(len) => len,
                Err(e) => {
                    println!("error: {e:?}");
                    return store;
                }
            };
            let mut out = vec![0; usize::from(len)];
            match store.get(key.as_bytes(), 0, &mut out) {
                Ok(()) => println!("{}", String::from_utf8_lossy(&out)),
                Err(e) => println!("error: {e:?}"),
            }
        }
        ["erase", key] => match store.erase(key.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(e) => println!("error: {e:?}"),
        },
        ["list"] => {
            for (key, len) in store.iter() {
                println!("{key:?}: {len} bytes");
            }
        }
        ["stats"] => println!("{:#?}", store.stats()),
        ["gc"] => match store.garbage_collect() {
            Ok(()) => println!("ok"),
            Err(e) => println!("error: {e:?}"),
        },
        ["tear", n] => match n.parse() {
            Ok(n) => {
                let mut flash = store.into_inner();
                flash.fail_after = Some(n);
                store = Store::new(flash);
                reboot(&mut store);
                println!("next {n} writes will land, then power is lost");
            }
            Err(_) => println!("tear takes a write count"),
        },
        ["reboot"] => {
            let mut flash = store.into_inner();
            flash.fail_after = None;
            store = Store::new(flash);
            reboot(&mut store);
        }
        _ => {
            println!("commands: put KEY VALUE | get KEY | erase KEY | list \
                | stats | gc | tear N | reboot");
        }
    }
    store
}

fn reboot(store: &mut Store<RamFlash>) {
    match store.enable() {
        Ok(()) => println!("enabled with {} keys", store.key_count()),
        Err(e) => println!("enable failed: {e:?}"),
    }
}

/// NOR flash simulated in RAM: writes may only program erased bytes.
struct RamFlash {
    data: Vec<u8>,
    sector_size: u32,
    alignment: u32,
    /// Writes left before every write starts failing.
    fail_after: Option<usize>,
}

#[derive(Copy, Clone, Debug)]
enum RamFlashError {
    OutOfBounds,
    NotErased,
    PowerLost,
}

impl RamFlash {
    fn new(sector_size: u32, sectors: u32, alignment: u32) -> Self {
        Self {
            data: vec![ERASED_BYTE; sector_size as usize * sectors as usize],
            sector_size,
            alignment,
            fail_after: None,
        }
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, RamFlashError> {
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(RamFlashError::OutOfBounds),
        }
    }
}

impl Flash for RamFlash {
    type Error = RamFlashError;

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / self.sector_size as usize) as u32
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }

    fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(address, dest.len())?;
        dest.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        match &mut self.fail_after {
            Some(0) => return Err(RamFlashError::PowerLost),
            Some(n) => *n -= 1,
            None => (),
        }
        let range = self.range(address, data.len())?;
        let target = &mut self.data[range];
        if target.iter().any(|&b| b != ERASED_BYTE) {
            return Err(RamFlashError::NotErased);
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, index: u32, count: u32) -> Result<(), EraseError<Self::Error>> {
        if self.fail_after == Some(0) {
            return Err(EraseError::Flash(RamFlashError::PowerLost));
        }
        let size = self.sector_size as usize;
        let range = self.range(index * self.sector_size, size * count as usize)?;
        self.data[range].fill(ERASED_BYTE);
        Ok(())
    }
}
