use clap::Parser;
use log::{debug, info};

use vmmc::backing::{FileImage, Storage};
use vmmc::services::{FixedClock, ManualTimer};
use vmmc::{Card, CardFamily, ModelError, Response, ResponseKind, Transport};

/// MMC/SD card model exerciser.
///
/// Mounts (or creates) a card image, brings the card through the
/// identification sequence, and reads back the first block.
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Args {
    /// Card image file.
    #[arg(long)]
    image: String,

    /// Card template product name.
    #[arg(long, default_value = "auto_sd")]
    product: String,

    /// Create the image with this size in MiB instead of opening it.
    #[arg(long)]
    create_mib: Option<u64>,

    /// Allocate a created image sparsely (holes read as zero, not as
    /// erased media).
    #[arg(long)]
    sparse: bool,

    /// Drive the card in SPI mode.
    #[arg(long)]
    spi: bool,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn step(card: &mut Card, cmd: u8, arg: u32) -> Option<Response> {
    match card.do_command(cmd, arg) {
        Ok(r) => {
            debug!("CMD{cmd} -> {:02x?}", r.as_bytes());
            Some(r)
        }
        Err(fault) => {
            debug!("CMD{cmd} -> no response ({fault:?})");
            None
        }
    }
}

/// Reset and identification sequence, native or SPI, MMC or SD.
fn identify(card: &mut Card, clock: &FixedClock) {
    let native = card.transport() == Transport::Native;
    let sd = card.family() == CardFamily::Sd;

    step(card, 0, 0);
    if sd {
        step(card, 8, 0x1aa);
    }

    for _ in 0..16 {
        let r = if sd {
            step(card, 55, 0);
            step(card, 41, 0x00ff_8000)
        } else {
            step(card, 1, 0x00ff_8000)
        };
        let ready = r.is_some_and(|r| match r.kind() {
            ResponseKind::R3 => r.as_bytes()[1] & 0x80 != 0,
            ResponseKind::SpiR1 => r.as_bytes()[0] & 0x01 == 0,
            _ => false,
        });
        if ready {
            break;
        }
        clock.advance_us(2_000);
    }

    if native {
        step(card, 2, 0);
        if sd {
            step(card, 3, 0);
        } else {
            step(card, 3, 1 << 16);
        }
        info!("relative card address 0x{:04x}", card.rca());
        step(card, 7, u32::from(card.rca()) << 16);
    } else {
        step(card, 58, 0);
    }
}

fn run(args: Args) -> Result<(), ModelError> {
    let store: Box<dyn Storage> = match args.create_mib {
        Some(mib) => Box::new(FileImage::create(&args.image, mib << 20, args.sparse)?),
        None => Box::new(FileImage::open(&args.image)?),
    };

    let timer = ManualTimer::new();
    let clock = FixedClock::new(25_000_000);
    let mut card = Card::new(&args.product, store, Box::new(timer.clone()), clock.clone())?;
    if args.spi {
        card.goto_spi_mode();
    }
    info!(
        "{}: {:?} card over {:?}, {} bytes, blocklen {}",
        card.product_name(),
        card.family(),
        card.transport(),
        card.capacity(),
        card.blocklen()
    );

    identify(&mut card, &clock);
    info!("CID {}", hex(card.cid()));
    info!("CSD {}", hex(card.csd()));

    let blocklen = card.blocklen();
    step(&mut card, 16, blocklen);
    step(&mut card, 17, 0);
    let mut block = vec![0u8; card.blocklen() as usize];
    let n = card.read(&mut block);
    info!("block 0: {n} bytes, leading {}", hex(&block[..16.min(n)]));

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
