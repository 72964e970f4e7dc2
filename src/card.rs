//! The live card: command dispatch, the protocol state machine, and the
//! host-facing data-phase API.
//!
//! A [`Card`] is driven entirely by its host controller. Commands arrive
//! through [`Card::do_command`]; data phases move through [`Card::read`] /
//! [`Card::write`], or autonomously toward a registered listener, paced by
//! the simulated bus clock through the timer service.

use std::rc::Rc;

use log::{debug, trace, warn};

use crate::ModelError;
use crate::backing::{ERASED_BYTE, Storage};
use crate::bits::{get_bits, set_bits};
use crate::listener::{CardListener, ListenerSlot};
use crate::response::Response;
use crate::services::{SimClock, TimerService};
use crate::spec::{self, OCR_HIGH_CAPACITY, OCR_POWER_UP};
use crate::state::{CardFamily, CardState, StatusFlags, Transport};
use crate::transfer::{Transfer, TransferKind};

/// Why a command produced no response. Externally all three look the same
/// (the card stays silent and the host times out); the distinction exists
/// for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFault {
    /// The command is not legal in the current card state.
    NotReady,
    /// An addressed command carried another card's RCA.
    AddressMismatch,
    /// No handler for this opcode in the active command set.
    Unsupported,
}

/// Timer-expiry events routed back into the card via [`Card::timer_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardEvent {
    #[default]
    None,
    /// Deliver the next paced packet to the listener.
    Transmit,
    /// A timed erase or program operation has finished.
    EraseDone,
}

type Handler = fn(&mut Card, u32) -> Result<Response, CommandFault>;

/// The dispatch tables active on a card: one slot per opcode for regular
/// commands and one for application commands. Built whole per
/// {family, transport} pair and only ever swapped whole.
struct CommandSet {
    regular: [Option<Handler>; 64],
    app: [Option<Handler>; 64],
}

impl CommandSet {
    fn build(family: CardFamily, transport: Transport) -> CommandSet {
        let mut regular: [Option<Handler>; 64] = [None; 64];
        let mut app: [Option<Handler>; 64] = [None; 64];

        regular[0] = Some(|c, a| c.cmd_go_idle(a));
        regular[9] = Some(|c, a| c.cmd_send_csd(a));
        regular[10] = Some(|c, a| c.cmd_send_cid(a));
        regular[12] = Some(|c, a| c.cmd_stop_transmission(a));
        regular[13] = Some(|c, a| c.cmd_send_status(a));
        regular[16] = Some(|c, a| c.cmd_set_blocklen(a));
        regular[17] = Some(|c, a| c.cmd_read_single(a));
        regular[18] = Some(|c, a| c.cmd_read_multiple(a));
        regular[23] = Some(|c, a| c.cmd_set_block_count(a));
        regular[24] = Some(|c, a| c.cmd_write_single(a));
        regular[25] = Some(|c, a| c.cmd_write_multiple(a));
        regular[27] = Some(|c, a| c.cmd_program_csd(a));
        regular[28] = Some(|c, a| c.cmd_set_write_prot(a));
        regular[29] = Some(|c, a| c.cmd_clr_write_prot(a));
        regular[30] = Some(|c, a| c.cmd_send_write_prot(a));
        regular[38] = Some(|c, a| c.cmd_erase(a));
        regular[55] = Some(|c, a| c.cmd_app(a));

        match family {
            CardFamily::Mmc | CardFamily::MmcPlus => {
                regular[1] = Some(|c, a| c.cmd_send_op_cond(a));
                regular[26] = Some(|c, a| c.cmd_program_cid(a));
                regular[35] = Some(|c, a| c.cmd_erase_start(a));
                regular[36] = Some(|c, a| c.cmd_erase_end(a));
            }
            CardFamily::Sd => {
                regular[6] = Some(|c, a| c.cmd_switch_sd(a));
                regular[8] = Some(|c, a| c.cmd_send_if_cond(a));
                regular[32] = Some(|c, a| c.cmd_erase_start(a));
                regular[33] = Some(|c, a| c.cmd_erase_end(a));
                app[6] = Some(|c, a| c.acmd_set_bus_width(a));
                app[13] = Some(|c, a| c.acmd_sd_status(a));
                app[22] = Some(|c, a| c.acmd_num_wr_blocks(a));
                app[23] = Some(|c, a| c.acmd_wr_blk_erase_count(a));
                app[41] = Some(|c, a| c.acmd_sd_op_cond(a));
                app[42] = Some(|c, a| c.acmd_card_detect(a));
                app[51] = Some(|c, a| c.acmd_send_scr(a));
            }
        }
        if family == CardFamily::Mmc {
            regular[11] = Some(|c, a| c.cmd_read_stream(a));
            regular[20] = Some(|c, a| c.cmd_write_stream(a));
        }
        if family == CardFamily::MmcPlus {
            regular[6] = Some(|c, a| c.cmd_switch_mmc(a));
        }

        match transport {
            Transport::Native => {
                regular[2] = Some(|c, a| c.cmd_all_send_cid(a));
                regular[3] = Some(|c, a| c.cmd_set_relative_addr(a));
                regular[4] = Some(|c, a| c.cmd_set_dsr(a));
                regular[7] = Some(|c, a| c.cmd_select(a));
                regular[15] = Some(|c, a| c.cmd_go_inactive(a));
            }
            Transport::Spi => {
                // Every family answers CMD1 over SPI; identification and
                // selection commands do not exist there.
                regular[1] = Some(|c, a| c.cmd_send_op_cond(a));
                regular[58] = Some(|c, a| c.cmd_read_ocr(a));
                regular[59] = Some(|c, a| c.cmd_crc_on_off(a));
            }
        }

        CommandSet { regular, app }
    }
}

/// A live MMC/SD card instance.
pub struct Card {
    name: &'static str,
    family: CardFamily,
    transport: Transport,
    state: CardState,
    flags: StatusFlags,

    cid: [u8; 16],
    csd: [u8; 16],
    scr: [u8; 8],
    ssr: [u8; 64],
    ocr: u32,
    rca: u16,
    next_rca: u16,
    dsr: u16,

    /// CSD-derived geometry, fixed for the card's lifetime.
    capacity: u64,
    default_blocklen: u32,
    high_capacity: bool,
    /// Session block length set by CMD16.
    blocklen: u32,

    reset_latency_us: u64,
    reset_started_us: Option<u64>,
    powered_up: bool,
    crc_checked: bool,

    /// Monotonic command counter; CMD23 pins a block count against it.
    cmd_seq: u64,
    app_armed: bool,
    last_cmd: u8,
    pinned_blocks: u32,
    pinned_seq: u64,
    erase_start: Option<u64>,
    erase_end: Option<u64>,

    transfer: Option<Transfer>,
    well_written: u32,
    pending: CardEvent,
    listener: ListenerSlot,
    cmds: CommandSet,

    store: Box<dyn Storage>,
    timer: Box<dyn TimerService>,
    clock: Rc<dyn SimClock>,
}

impl Card {
    /// Build a card from the named template around an exclusively owned
    /// backing store.
    pub fn new(
        product: &str,
        store: Box<dyn Storage>,
        timer: Box<dyn TimerService>,
        clock: Rc<dyn SimClock>,
    ) -> Result<Card, ModelError> {
        let template =
            spec::lookup(product).ok_or_else(|| ModelError::UnknownProduct(product.into()))?;
        let size = store.size();
        if size == 0 {
            return Err(ModelError::EmptyImage);
        }

        let mut cid = template.cid;
        let mut csd = template.csd;
        if template.auto_capacity {
            spec::encode_capacity(&mut csd, size)?;
            spec::patch_cid(&mut cid, template.name, spec::next_instance(), size);
        }
        let (capacity, default_blocklen) = spec::decode_capacity(&csd)?;
        let high_capacity = spec::is_high_capacity(&csd);
        if size < capacity {
            warn!(
                "{}: image is {size} bytes but the CSD declares {capacity}, \
                 reads past the image yield erased data",
                template.name
            );
        }

        debug!(
            "{}: {:?} card, {capacity} bytes, blocklen {default_blocklen}",
            template.name, template.family
        );

        Ok(Card {
            name: template.name,
            family: template.family,
            transport: Transport::Native,
            state: CardState::Idle,
            flags: StatusFlags::empty(),
            cid,
            csd,
            scr: template.scr,
            ssr: template.ssr,
            ocr: template.ocr,
            rca: 0,
            next_rca: template.initial_rca.unwrap_or(1).max(1),
            dsr: 0x404,
            capacity,
            default_blocklen,
            high_capacity,
            blocklen: default_blocklen,
            reset_latency_us: template.reset_latency_us,
            reset_started_us: None,
            powered_up: false,
            crc_checked: true,
            cmd_seq: 0,
            app_armed: false,
            last_cmd: 0,
            pinned_blocks: 0,
            pinned_seq: 0,
            erase_start: None,
            erase_end: None,
            transfer: None,
            well_written: 0,
            pending: CardEvent::None,
            listener: ListenerSlot::default(),
            cmds: CommandSet::build(template.family, Transport::Native),
            store,
            timer,
            clock,
        })
    }

    pub fn product_name(&self) -> &'static str {
        self.name
    }

    pub fn family(&self) -> CardFamily {
        self.family
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn rca(&self) -> u16 {
        self.rca
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn blocklen(&self) -> u32 {
        self.blocklen
    }

    pub fn crc_checked(&self) -> bool {
        self.crc_checked
    }

    pub fn dsr(&self) -> u16 {
        self.dsr
    }

    pub fn cid(&self) -> &[u8; 16] {
        &self.cid
    }

    pub fn csd(&self) -> &[u8; 16] {
        &self.csd
    }

    /// Submit one command. A fault means the card stays silent and the
    /// host's command timeout applies.
    pub fn do_command(&mut self, cmd: u8, arg: u32) -> Result<Response, CommandFault> {
        self.cmd_seq += 1;
        if self.state == CardState::Inactive {
            return Err(CommandFault::NotReady);
        }
        let opcode = (cmd & 0x3f) as usize;
        self.last_cmd = opcode as u8;

        // The app flag is one-shot: consumed here no matter what follows.
        let app = std::mem::replace(&mut self.app_armed, false);
        let handler = if app {
            match self.cmds.app[opcode] {
                Some(h) => {
                    trace!("{}: ACMD{opcode} arg=0x{arg:08x}", self.name);
                    Some(h)
                }
                // No app variant: the opcode keeps its regular meaning.
                None => self.cmds.regular[opcode],
            }
        } else {
            self.cmds.regular[opcode]
        };
        let Some(handler) = handler else {
            warn!("{}: unsupported CMD{opcode} arg=0x{arg:08x}", self.name);
            return Err(CommandFault::Unsupported);
        };
        if !app {
            trace!("{}: CMD{opcode} arg=0x{arg:08x}", self.name);
        }
        handler(self, arg)
    }

    /// Switch the card to SPI framing. One-way; both dispatch tables are
    /// replaced together and the protocol restarts from Idle.
    pub fn goto_spi_mode(&mut self) {
        if self.transport == Transport::Spi {
            return;
        }
        debug!("{}: entering SPI mode", self.name);
        self.transport = Transport::Spi;
        self.cmds = CommandSet::build(self.family, Transport::Spi);
        self.state = CardState::Idle;
        self.flags = StatusFlags::empty();
        self.rca = 0;
        self.blocklen = self.default_blocklen;
        self.pinned_blocks = 0;
        self.erase_start = None;
        self.erase_end = None;
        self.powered_up = false;
        self.reset_started_us = None;
        self.transfer = None;
        self.pending = CardEvent::None;
        self.timer.cancel();
    }

    /// Register the single listener for autonomously transmitted data.
    pub fn add_listener(
        &mut self,
        listener: &Rc<dyn CardListener>,
        max_packet: usize,
    ) -> Result<(), ModelError> {
        if self.listener.add(listener, max_packet.max(1)) {
            Ok(())
        } else {
            warn!("{}: listener slot already occupied", self.name);
            Err(ModelError::ListenerBusy)
        }
    }

    /// Unregister a listener; ignored unless `listener` is the occupant.
    pub fn remove_listener(&mut self, listener: &Rc<dyn CardListener>) -> bool {
        self.listener.remove(listener)
    }

    /// Host-paced read of the active data phase. Returns up to `buf.len()`
    /// bytes clipped to the block boundary, 0 when there is nothing to
    /// send.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(transfer) = self.transfer.as_mut() else {
            return 0;
        };
        if !transfer.kind().is_read() {
            return 0;
        }
        let n = transfer.pull(self.store.as_mut(), buf);
        let done = transfer.is_done();
        let past_end = transfer.reached_media_end();
        if done {
            if past_end {
                self.flags |= StatusFlags::OUT_OF_RANGE;
            }
            self.finish_transfer();
        }
        n
    }

    /// Host-paced write into the active data phase. Returns the number of
    /// bytes accepted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.state != CardState::Receive {
            return 0;
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return 0;
        };
        if transfer.kind().is_read() {
            return 0;
        }
        let out = transfer.push(self.store.as_mut(), data);
        let past_end = transfer.reached_media_end();
        self.well_written += out.committed as u32;
        if out.done {
            if past_end {
                self.flags |= StatusFlags::OUT_OF_RANGE;
            }
            self.finish_transfer();
        }
        out.consumed
    }

    /// Timer-expiry reentry point; the embedder calls this when the delay
    /// scheduled on the timer service elapses.
    pub fn timer_due(&mut self) {
        match std::mem::replace(&mut self.pending, CardEvent::None) {
            CardEvent::None => {}
            CardEvent::Transmit => self.transmit_packet(),
            CardEvent::EraseDone => {
                debug!("{}: program/erase finished", self.name);
                match self.state {
                    CardState::Program => self.state = CardState::Transfer,
                    CardState::Disconnect => self.state = CardState::Standby,
                    _ => {}
                }
            }
        }
    }

    fn transmit_packet(&mut self) {
        let Some((listener, max_packet)) = self.listener.get() else {
            debug!("{}: listener gone, stopping transmission", self.name);
            return;
        };
        let mut buf = vec![0u8; max_packet];
        let n = self.read(&mut buf);
        if n == 0 {
            return;
        }
        listener.receive(&buf[..n]);
        if self.transfer.is_some() {
            self.pending = CardEvent::Transmit;
            self.schedule_bytes(n);
        }
    }

    fn start_transmit(&mut self) {
        if self.pending == CardEvent::Transmit {
            // A second paced stream would corrupt the pacing of the first;
            // the new requester loses.
            warn!("{}: transmission already scheduled", self.name);
            return;
        }
        if !self.listener.is_occupied() {
            return;
        }
        self.pending = CardEvent::Transmit;
        self.schedule_bytes(1);
    }

    fn schedule_bytes(&mut self, bytes: usize) {
        let freq = match self.clock.frequency() {
            // Clock tree not configured yet: identification frequency.
            0 => 400_000,
            f => f,
        };
        let delay_ns = (bytes as u64) * 8 * 1_000_000_000 / freq;
        self.timer.schedule(delay_ns.max(1));
    }

    /// Tear down the finished transfer, committing register programs and
    /// returning the state machine to Transfer.
    fn finish_transfer(&mut self) {
        let Some(mut transfer) = self.transfer.take() else {
            return;
        };
        match transfer.kind() {
            TransferKind::ProgramCid => {
                let staged = transfer.take_staged();
                if staged.len() == 16 {
                    self.cid[..15].copy_from_slice(&staged[..15]);
                    let trailer = spec::register_trailer(&self.cid);
                    self.cid[15] = trailer;
                    debug!("{}: CID reprogrammed", self.name);
                }
            }
            TransferKind::ProgramCsd => {
                let staged = transfer.take_staged();
                if staged.len() == 16 {
                    // Only the programmable byte (copy and write-protect
                    // bits) is accepted; the capacity geometry stays fixed
                    // for the card's lifetime.
                    self.csd[14] = staged[14];
                    let trailer = spec::register_trailer(&self.csd);
                    self.csd[15] = trailer;
                    debug!("{}: CSD programmed, byte14=0x{:02x}", self.name, staged[14]);
                }
            }
            _ => {}
        }
        if self.pending == CardEvent::Transmit {
            self.pending = CardEvent::None;
            self.timer.cancel();
        }
        if matches!(self.state, CardState::Data | CardState::Receive) {
            self.state = CardState::Transfer;
        }
    }

    // ---- status and response assembly ----

    /// Read-and-clear of the 32-bit status register.
    fn take_status(&mut self) -> u32 {
        let mut value = self.flags.bits() | (self.state.status_code() << 9);
        if !matches!(self.state, CardState::Program | CardState::Disconnect) {
            value |= StatusFlags::READY_FOR_DATA.bits();
        }
        self.flags.remove(StatusFlags::STICKY);
        value
    }

    /// The 16-bit status subset carried by R6.
    fn r6_status(&mut self) -> u16 {
        let status = self.take_status();
        let mut value = (status & 0x1fff) as u16;
        if status & StatusFlags::COM_CRC_ERROR.bits() != 0 {
            value |= 1 << 15;
        }
        if status & StatusFlags::ILLEGAL_COMMAND.bits() != 0 {
            value |= 1 << 14;
        }
        if status & StatusFlags::ERROR.bits() != 0 {
            value |= 1 << 13;
        }
        value
    }

    /// The SPI R1 status byte; reading clears the sticky error bits.
    fn spi_status(&mut self) -> u8 {
        let mut value = 0u8;
        if self.state == CardState::Idle {
            value |= 0x01;
        }
        if self.flags.contains(StatusFlags::ERASE_RESET) {
            value |= 0x02;
        }
        if self.flags.contains(StatusFlags::ILLEGAL_COMMAND) {
            value |= 0x04;
        }
        if self.flags.contains(StatusFlags::COM_CRC_ERROR) {
            value |= 0x08;
        }
        if self.flags.contains(StatusFlags::ERASE_SEQ_ERROR) {
            value |= 0x10;
        }
        if self.flags.contains(StatusFlags::ADDRESS_ERROR) {
            value |= 0x20;
        }
        if self
            .flags
            .intersects(StatusFlags::OUT_OF_RANGE | StatusFlags::BLOCK_LEN_ERROR)
        {
            value |= 0x40;
        }
        self.flags.remove(StatusFlags::STICKY);
        value
    }

    /// The second byte of the SPI R2 status.
    fn spi_status2(&self) -> u8 {
        let mut value = 0u8;
        if self.flags.contains(StatusFlags::CARD_IS_LOCKED) {
            value |= 0x01;
        }
        if self.flags.contains(StatusFlags::ERROR) {
            value |= 0x04;
        }
        if self.flags.contains(StatusFlags::CC_ERROR) {
            value |= 0x08;
        }
        if self.flags.contains(StatusFlags::CARD_ECC_FAILED) {
            value |= 0x10;
        }
        if self.flags.contains(StatusFlags::WP_VIOLATION) {
            value |= 0x20;
        }
        if self.flags.contains(StatusFlags::ERASE_PARAM) {
            value |= 0x40;
        }
        if self.flags.contains(StatusFlags::OUT_OF_RANGE) {
            value |= 0x80;
        }
        value
    }

    fn r1(&mut self) -> Response {
        match self.transport {
            Transport::Native => Response::r1(self.last_cmd, self.take_status()),
            Transport::Spi => {
                let status = self.spi_status();
                Response::spi_r1(status)
            }
        }
    }

    fn r1b(&mut self) -> Response {
        match self.transport {
            Transport::Native => Response::r1b(self.last_cmd, self.take_status()),
            Transport::Spi => {
                let status = self.spi_status();
                Response::spi_r1b(status)
            }
        }
    }

    fn ocr_value(&self) -> u32 {
        let mut value = self.ocr;
        if self.powered_up {
            value |= OCR_POWER_UP;
        }
        if self.high_capacity {
            value |= OCR_HIGH_CAPACITY;
        }
        value
    }

    // ---- shared handler helpers ----

    /// Media byte address of a data-command argument; high-capacity cards
    /// address in 512-byte sectors.
    fn data_addr(&self, arg: u32) -> u64 {
        if self.high_capacity {
            u64::from(arg) * 512
        } else {
            u64::from(arg)
        }
    }

    /// Validate alignment and capacity bounds of a data command, raising
    /// the matching status error on failure.
    fn check_data_range(&mut self, addr: u64, blocks: u64) -> bool {
        let blocklen = u64::from(self.blocklen);
        if addr % blocklen != 0 {
            warn!("{}: misaligned data address 0x{addr:08x}", self.name);
            self.flags |= StatusFlags::ADDRESS_ERROR;
            return false;
        }
        if addr + blocks.max(1) * blocklen > self.capacity {
            warn!("{}: data address 0x{addr:08x} beyond capacity", self.name);
            self.flags |= StatusFlags::OUT_OF_RANGE;
            return false;
        }
        true
    }

    fn write_protected(&self) -> bool {
        let (from, to) = spec::CSD_TMP_WRITE_PROTECT;
        get_bits(&self.csd, from, to) != 0
    }

    fn set_write_protect(&mut self, on: bool) {
        let (from, to) = spec::CSD_TMP_WRITE_PROTECT;
        set_bits(u64::from(on), &mut self.csd, from, to);
        let trailer = spec::register_trailer(&self.csd);
        self.csd[15] = trailer;
    }

    /// The block count a directly preceding CMD23 pinned, if any.
    fn take_pin(&mut self) -> Option<u64> {
        if self.pinned_blocks != 0 && self.pinned_seq + 1 == self.cmd_seq {
            Some(u64::from(self.pinned_blocks))
        } else {
            None
        }
    }

    /// Advance the power-up sequence across repeated CMD1/ACMD41 polls.
    fn poll_power_up(&mut self, query: bool) {
        let now = self.clock.elapsed_us();
        let started = match self.reset_started_us {
            Some(t) => t,
            None => {
                self.reset_started_us = Some(now);
                now
            }
        };
        if !self.powered_up && now - started >= self.reset_latency_us {
            debug!("{}: power-up complete after {}us", self.name, now - started);
            self.powered_up = true;
        }
        if self.powered_up && !query && self.state == CardState::Idle {
            // SPI cards have no identification phase; they come up
            // selected.
            self.state = match self.transport {
                Transport::Native => CardState::Ready,
                Transport::Spi => CardState::Transfer,
            };
        }
    }

    fn rca_matches(&self, arg: u32) -> bool {
        self.transport == Transport::Spi || (arg >> 16) as u16 == self.rca
    }

    // ---- command handlers ----

    fn cmd_go_idle(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        debug!("{}: reset to idle", self.name);
        self.state = CardState::Idle;
        self.flags = StatusFlags::empty();
        self.rca = 0;
        self.blocklen = self.default_blocklen;
        self.transfer = None;
        self.pending = CardEvent::None;
        self.timer.cancel();
        self.erase_start = None;
        self.erase_end = None;
        self.pinned_blocks = 0;
        self.powered_up = false;
        self.reset_started_us = None;
        match self.transport {
            Transport::Native => Ok(Response::none()),
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_r1(status))
            }
        }
    }

    /// CMD1 (MMC native, every family over SPI).
    fn cmd_send_op_cond(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if !matches!(self.state, CardState::Idle | CardState::Ready) {
            return Err(CommandFault::NotReady);
        }
        self.poll_power_up(arg == 0);
        match self.transport {
            Transport::Native => Ok(Response::r3(self.ocr_value())),
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_r1(status))
            }
        }
    }

    fn cmd_all_send_cid(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Ready {
            return Err(CommandFault::NotReady);
        }
        self.state = CardState::Ident;
        Ok(Response::r2(&self.cid))
    }

    /// CMD3: the card publishes an RCA (SD) or accepts one (MMC).
    fn cmd_set_relative_addr(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if !matches!(self.state, CardState::Ident | CardState::Standby) {
            return Err(CommandFault::NotReady);
        }
        match self.family {
            CardFamily::Sd => {
                self.rca = self.next_rca;
                self.next_rca = self.next_rca.wrapping_add(1);
                if self.next_rca == 0 {
                    self.next_rca = 1;
                }
                self.state = CardState::Standby;
                debug!("{}: published RCA 0x{:04x}", self.name, self.rca);
                let status = self.r6_status();
                Ok(Response::r6(self.rca, status))
            }
            CardFamily::Mmc | CardFamily::MmcPlus => {
                let rca = (arg >> 16) as u16;
                if rca == 0 {
                    // RCA 0 is the broadcast/deselect address.
                    warn!("{}: refusing relative address 0", self.name);
                    return Err(CommandFault::AddressMismatch);
                }
                self.rca = rca;
                self.state = CardState::Standby;
                debug!("{}: assigned RCA 0x{rca:04x}", self.name);
                Ok(self.r1())
            }
        }
    }

    fn cmd_set_dsr(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Standby {
            return Err(CommandFault::NotReady);
        }
        self.dsr = (arg >> 16) as u16;
        debug!("{}: DSR set to 0x{:04x}", self.name, self.dsr);
        Ok(Response::none())
    }

    /// SD CMD6: switch function. The 64-byte function-status block goes out
    /// through the data path.
    fn cmd_switch_sd(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let block = self.switch_status(arg);
        self.transfer = Some(Transfer::register_read(block.to_vec()));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// Build the CMD6 function-status block. Only the default function of
    /// each group is implemented; other selections report 0xf (error).
    fn switch_status(&mut self, arg: u32) -> [u8; 64] {
        let mut block = [0u8; 64];
        // Maximum current consumption, mA.
        set_bits(0x0032, &mut block, 496, 511);
        for group in 0..6u32 {
            set_bits(0x0001, &mut block, 400 + 16 * group, 415 + 16 * group);
            let requested = u64::from((arg >> (4 * group)) & 0xf);
            let selected = if requested == 0 || requested == 0xf { 0 } else { 0xf };
            set_bits(selected, &mut block, 376 + 4 * group, 379 + 4 * group);
        }
        if arg & 0x8000_0000 != 0 {
            debug!("{}: switch functions committed, arg=0x{arg:08x}", self.name);
        }
        block
    }

    /// MMC-Plus CMD6: SWITCH. The extended CSD itself is not modeled, so
    /// the access is logged and acknowledged.
    fn cmd_switch_mmc(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        debug!(
            "{}: SWITCH access={} index={} value={}",
            self.name,
            (arg >> 24) & 3,
            (arg >> 16) & 0xff,
            (arg >> 8) & 0xff
        );
        Ok(self.r1b())
    }

    fn cmd_select(&mut self, arg: u32) -> Result<Response, CommandFault> {
        let addressed = (arg >> 16) as u16 == self.rca;
        match self.state {
            CardState::Standby if addressed => {
                trace!("{}: selected", self.name);
                self.state = CardState::Transfer;
                Ok(self.r1b())
            }
            CardState::Standby => Err(CommandFault::AddressMismatch),
            CardState::Transfer | CardState::Data | CardState::Receive if !addressed => {
                // Deselection aborts any data phase; no response from a
                // deselected card.
                trace!("{}: deselected", self.name);
                self.transfer = None;
                self.pending = CardEvent::None;
                self.timer.cancel();
                self.state = CardState::Standby;
                Ok(Response::none())
            }
            CardState::Program if !addressed => {
                self.state = CardState::Disconnect;
                Ok(Response::none())
            }
            CardState::Disconnect if addressed => {
                self.state = CardState::Program;
                Ok(self.r1b())
            }
            _ => Err(CommandFault::NotReady),
        }
    }

    /// SD CMD8: interface condition. Only 2.7-3.6V is accepted; other
    /// voltage ranges get no answer, as the specification prescribes.
    fn cmd_send_if_cond(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Idle {
            return Err(CommandFault::NotReady);
        }
        if (arg >> 8) & 0xf != 0x1 {
            return Ok(Response::none());
        }
        let echo = arg & 0xfff;
        match self.transport {
            Transport::Native => Ok(Response::r7(echo)),
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_r7(status, echo))
            }
        }
    }

    fn cmd_send_csd(&mut self, arg: u32) -> Result<Response, CommandFault> {
        match self.transport {
            Transport::Native => {
                if self.state != CardState::Standby {
                    return Err(CommandFault::NotReady);
                }
                if !self.rca_matches(arg) {
                    return Err(CommandFault::AddressMismatch);
                }
                Ok(Response::r2(&self.csd))
            }
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_reg_block(status, &self.csd))
            }
        }
    }

    fn cmd_send_cid(&mut self, arg: u32) -> Result<Response, CommandFault> {
        match self.transport {
            Transport::Native => {
                if self.state != CardState::Standby {
                    return Err(CommandFault::NotReady);
                }
                if !self.rca_matches(arg) {
                    return Err(CommandFault::AddressMismatch);
                }
                Ok(Response::r2(&self.cid))
            }
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_reg_block(status, &self.cid))
            }
        }
    }

    /// MMC CMD11: stream read until CMD12.
    fn cmd_read_stream(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let addr = self.data_addr(arg);
        if addr >= self.capacity {
            self.flags |= StatusFlags::OUT_OF_RANGE;
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_read(
            TransferKind::StreamRead,
            addr,
            self.blocklen,
            None,
            self.capacity,
        ));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// MMC CMD20: stream write until CMD12.
    fn cmd_write_stream(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        if self.write_protected() {
            self.flags |= StatusFlags::WP_VIOLATION;
            return Ok(self.r1());
        }
        let addr = self.data_addr(arg);
        if addr >= self.capacity {
            self.flags |= StatusFlags::OUT_OF_RANGE;
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_write(
            TransferKind::StreamWrite,
            addr,
            self.blocklen,
            None,
            self.capacity,
        ));
        self.well_written = 0;
        self.state = CardState::Receive;
        Ok(self.r1())
    }

    fn cmd_stop_transmission(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if !matches!(self.state, CardState::Data | CardState::Receive) {
            return Err(CommandFault::NotReady);
        }
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.stop();
        }
        self.finish_transfer();
        Ok(self.r1b())
    }

    fn cmd_send_status(&mut self, arg: u32) -> Result<Response, CommandFault> {
        match self.transport {
            Transport::Native => {
                if !self.state.is_addressed() {
                    return Err(CommandFault::NotReady);
                }
                if !self.rca_matches(arg) {
                    return Err(CommandFault::AddressMismatch);
                }
                let status = self.take_status();
                Ok(Response::r1(self.last_cmd, status))
            }
            Transport::Spi => {
                let status2 = self.spi_status2();
                let status = self.spi_status();
                Ok(Response::spi_r2(status, status2))
            }
        }
    }

    fn cmd_go_inactive(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if !self.state.is_addressed() {
            return Err(CommandFault::NotReady);
        }
        if !self.rca_matches(arg) {
            return Err(CommandFault::AddressMismatch);
        }
        debug!("{}: going inactive", self.name);
        self.state = CardState::Inactive;
        self.transfer = None;
        self.pending = CardEvent::None;
        self.timer.cancel();
        Ok(Response::none())
    }

    fn cmd_set_blocklen(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let ok = arg.is_power_of_two()
            && arg <= self.default_blocklen
            && (!self.high_capacity || arg == 512);
        if ok {
            debug!("{}: block length {arg}", self.name);
            self.blocklen = arg;
        } else {
            warn!("{}: rejecting block length {arg}", self.name);
            self.flags |= StatusFlags::BLOCK_LEN_ERROR;
        }
        Ok(self.r1())
    }

    fn cmd_read_single(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let addr = self.data_addr(arg);
        if !self.check_data_range(addr, 1) {
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_read(
            TransferKind::SingleRead,
            addr,
            self.blocklen,
            Some(1),
            self.capacity,
        ));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    fn cmd_read_multiple(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let addr = self.data_addr(arg);
        let blocks = self.take_pin();
        if !self.check_data_range(addr, blocks.unwrap_or(1)) {
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_read(
            TransferKind::MultiRead,
            addr,
            self.blocklen,
            blocks,
            self.capacity,
        ));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// CMD23: pin a block count for the immediately following multi-block
    /// command. Anything in between voids the pin.
    fn cmd_set_block_count(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.pinned_blocks = arg & 0xffff;
        self.pinned_seq = self.cmd_seq;
        Ok(self.r1())
    }

    fn cmd_write_single(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        if self.write_protected() {
            self.flags |= StatusFlags::WP_VIOLATION;
            return Ok(self.r1());
        }
        let addr = self.data_addr(arg);
        if !self.check_data_range(addr, 1) {
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_write(
            TransferKind::SingleWrite,
            addr,
            self.blocklen,
            Some(1),
            self.capacity,
        ));
        self.well_written = 0;
        self.state = CardState::Receive;
        Ok(self.r1())
    }

    fn cmd_write_multiple(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        if self.write_protected() {
            self.flags |= StatusFlags::WP_VIOLATION;
            return Ok(self.r1());
        }
        let addr = self.data_addr(arg);
        let blocks = self.take_pin();
        if !self.check_data_range(addr, blocks.unwrap_or(1)) {
            return Ok(self.r1());
        }
        self.transfer = Some(Transfer::media_write(
            TransferKind::MultiWrite,
            addr,
            self.blocklen,
            blocks,
            self.capacity,
        ));
        self.well_written = 0;
        self.state = CardState::Receive;
        Ok(self.r1())
    }

    /// MMC CMD26: program the CID through the data path.
    fn cmd_program_cid(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.transfer = Some(Transfer::register_write(TransferKind::ProgramCid));
        self.state = CardState::Receive;
        Ok(self.r1())
    }

    fn cmd_program_csd(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.transfer = Some(Transfer::register_write(TransferKind::ProgramCsd));
        self.state = CardState::Receive;
        Ok(self.r1())
    }

    fn cmd_set_write_prot(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        debug!("{}: write protect set, group 0x{arg:08x}", self.name);
        self.set_write_protect(true);
        Ok(self.r1b())
    }

    fn cmd_clr_write_prot(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        debug!("{}: write protect cleared, group 0x{arg:08x}", self.name);
        self.set_write_protect(false);
        Ok(self.r1b())
    }

    /// CMD30: push the 32-bit write-protection bitmap through the data
    /// path. Only the global temporary protect is modeled, so the bitmap
    /// is all-ones or all-zeroes.
    fn cmd_send_write_prot(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let bitmap: u32 = if self.write_protected() { !0 } else { 0 };
        self.transfer = Some(Transfer::register_read(bitmap.to_be_bytes().to_vec()));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// CMD32 (SD) / CMD35 (MMC): first address of the erase range.
    fn cmd_erase_start(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.erase_start = Some(self.data_addr(arg));
        Ok(self.r1())
    }

    /// CMD33 (SD) / CMD36 (MMC): last address of the erase range.
    fn cmd_erase_end(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.erase_end = Some(self.data_addr(arg));
        Ok(self.r1())
    }

    /// CMD38: erase the tagged range, then hold Program state until the
    /// completion event scaled to the erased size fires.
    fn cmd_erase(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let (start, end) = (self.erase_start.take(), self.erase_end.take());
        let (Some(start), Some(end)) = (start, end) else {
            warn!("{}: erase without a tagged range", self.name);
            self.flags |= StatusFlags::ERASE_SEQ_ERROR;
            return Ok(self.r1());
        };
        if start > end || start >= self.capacity {
            warn!("{}: bad erase range 0x{start:08x}..0x{end:08x}", self.name);
            self.flags |= StatusFlags::ERASE_PARAM;
            return Ok(self.r1());
        }
        if self.write_protected() {
            self.flags |= StatusFlags::WP_ERASE_SKIP | StatusFlags::WP_VIOLATION;
            return Ok(self.r1());
        }

        let blocklen = u64::from(self.blocklen);
        let from = start - start % blocklen;
        let to = ((end / blocklen + 1) * blocklen).min(self.capacity);
        let bytes = to - from;
        const ERASE_WARN: u64 = 16 << 20;
        if bytes > ERASE_WARN {
            warn!(
                "{}: erasing {} KiB, host image writes may stall the simulation",
                self.name,
                bytes >> 10
            );
        }
        let chunk = vec![ERASED_BYTE; 64 * 1024];
        let mut addr = from;
        while addr < to {
            let n = ((to - addr) as usize).min(chunk.len());
            if let Err(err) = self.store.write_at(addr, &chunk[..n]) {
                warn!("{}: erase write at 0x{addr:08x} failed: {err}", self.name);
                break;
            }
            addr += n as u64;
        }
        debug!("{}: erased 0x{from:08x}..0x{to:08x}", self.name);

        self.state = CardState::Program;
        self.pending = CardEvent::EraseDone;
        // 100us of simulated busy time per erased block.
        let blocks = (bytes / blocklen).max(1);
        self.timer.schedule(blocks * 100_000);
        Ok(self.r1b())
    }

    fn cmd_app(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.transport == Transport::Native
            && self.state.is_addressed()
            && !self.rca_matches(arg)
        {
            return Err(CommandFault::AddressMismatch);
        }
        self.app_armed = true;
        self.flags |= StatusFlags::APP_CMD;
        Ok(self.r1())
    }

    /// SPI CMD58: read OCR.
    fn cmd_read_ocr(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        let status = self.spi_status();
        Ok(Response::spi_r3(status, self.ocr_value()))
    }

    /// SPI CMD59: CRC check enable.
    fn cmd_crc_on_off(&mut self, arg: u32) -> Result<Response, CommandFault> {
        self.crc_checked = arg & 1 != 0;
        debug!("{}: CRC checking {}", self.name, if self.crc_checked { "on" } else { "off" });
        let status = self.spi_status();
        Ok(Response::spi_r1(status))
    }

    // ---- application command handlers (SD) ----

    fn acmd_set_bus_width(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let width = match arg & 3 {
            0 => 0u64, // 1 bit
            2 => 2u64, // 4 bit
            other => {
                warn!("{}: unsupported bus width code {other}", self.name);
                return Ok(self.r1());
            }
        };
        let (from, to) = spec::SSR_DAT_BUS_WIDTH;
        set_bits(width, &mut self.ssr, from, to);
        debug!("{}: bus width {}", self.name, if width == 0 { 1 } else { 4 });
        Ok(self.r1())
    }

    /// ACMD13: push the 64-byte SD status register through the data path.
    fn acmd_sd_status(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.transfer = Some(Transfer::register_read(self.ssr.to_vec()));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// ACMD22: push the count of well-written blocks from the last write.
    fn acmd_num_wr_blocks(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        let count = self.well_written.to_be_bytes();
        self.transfer = Some(Transfer::register_read(count.to_vec()));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }

    /// ACMD23: pre-erase hint for a following multi-block write. The model
    /// has no erase-before-write cost, so the hint is only acknowledged.
    fn acmd_wr_blk_erase_count(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        trace!("{}: pre-erase hint, {} blocks", self.name, arg & 0x7fffff);
        Ok(self.r1())
    }

    /// ACMD41: SD power-up polling.
    fn acmd_sd_op_cond(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if !matches!(self.state, CardState::Idle | CardState::Ready) {
            return Err(CommandFault::NotReady);
        }
        self.poll_power_up(arg & 0x00ff_ffff == 0);
        match self.transport {
            Transport::Native => Ok(Response::r3(self.ocr_value())),
            Transport::Spi => {
                let status = self.spi_status();
                Ok(Response::spi_r1(status))
            }
        }
    }

    /// ACMD42: card-detect pull-up control; nothing electrical to model.
    fn acmd_card_detect(&mut self, arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        trace!("{}: card-detect pull-up {}", self.name, arg & 1);
        Ok(self.r1())
    }

    /// ACMD51: push the SCR through the data path.
    fn acmd_send_scr(&mut self, _arg: u32) -> Result<Response, CommandFault> {
        if self.state != CardState::Transfer {
            return Err(CommandFault::NotReady);
        }
        self.transfer = Some(Transfer::register_read(self.scr.to_vec()));
        self.state = CardState::Data;
        let r = self.r1();
        self.start_transmit();
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::backing::MemImage;
    use crate::response::ResponseKind;
    use crate::services::{FixedClock, ManualTimer};

    fn test_card(product: &str, size: usize) -> (Card, Rc<RefCell<ManualTimer>>, Rc<FixedClock>) {
        let timer = ManualTimer::new();
        let clock = FixedClock::new(25_000_000);
        let card = Card::new(
            product,
            Box::new(MemImage::new(size)),
            Box::new(timer.clone()),
            clock.clone(),
        )
        .unwrap();
        (card, timer, clock)
    }

    fn status_of(r: &Response) -> u32 {
        assert!(r.len() >= 6, "not a 48-bit frame: {r:?}");
        u32::from_be_bytes(r.as_bytes()[1..5].try_into().unwrap())
    }

    fn current_state(status: u32) -> u32 {
        (status >> 9) & 0xf
    }

    /// Drive an SD card through CMD0/ACMD41/CMD2/CMD3/CMD7 into Transfer.
    fn init_sd(card: &mut Card, clock: &FixedClock) -> u16 {
        card.do_command(0, 0).unwrap();
        assert_eq!(card.state(), CardState::Idle);

        card.do_command(55, 0).unwrap();
        let r = card.do_command(41, 0x00ff_8000).unwrap();
        assert_eq!(status_of(&r) & OCR_POWER_UP, 0, "still busy");
        assert_eq!(card.state(), CardState::Idle);

        clock.advance_us(10_000);
        card.do_command(55, 0).unwrap();
        let r = card.do_command(41, 0x00ff_8000).unwrap();
        assert_ne!(status_of(&r) & OCR_POWER_UP, 0);
        assert_eq!(card.state(), CardState::Ready);

        let r = card.do_command(2, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::R2);
        assert_eq!(&r.as_bytes()[1..17], card.cid());
        assert_eq!(card.state(), CardState::Ident);

        let r = card.do_command(3, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::R6);
        let rca = u16::from_be_bytes(r.as_bytes()[1..3].try_into().unwrap());
        assert_eq!(rca, card.rca());
        assert_ne!(rca, 0);
        assert_eq!(card.state(), CardState::Standby);

        card.do_command(7, u32::from(rca) << 16).unwrap();
        assert_eq!(card.state(), CardState::Transfer);
        rca
    }

    #[test]
    fn test_end_to_end_init_and_read() {
        let (mut card, _timer, clock) = test_card("auto_sd", 16 << 20);
        assert_eq!(card.capacity(), 16 << 20);
        assert_eq!(card.blocklen(), 512);

        init_sd(&mut card, &clock);
        let r = card.do_command(16, 512).unwrap();
        assert_eq!(status_of(&r) & StatusFlags::BLOCK_LEN_ERROR.bits(), 0);

        let r = card.do_command(17, 0).unwrap();
        assert_eq!(current_state(status_of(&r)), CardState::Data.status_code());
        let mut buf = [0u8; 1024];
        assert_eq!(card.read(&mut buf), 512);
        assert_eq!(&buf[..512], &[0xff; 512]);
        assert_eq!(card.state(), CardState::Transfer);
        assert_eq!(card.read(&mut buf), 0);
    }

    #[test]
    fn test_illegal_state_leaves_card_untouched() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        let rca = card.rca();
        // Deselect, then try a data command from Standby.
        card.do_command(7, 0).unwrap();
        assert_eq!(card.state(), CardState::Standby);
        assert_eq!(card.do_command(17, 0), Err(CommandFault::NotReady));
        assert_eq!(card.state(), CardState::Standby);
        assert_eq!(card.rca(), rca);
        // Unknown opcode.
        assert_eq!(card.do_command(60, 0), Err(CommandFault::Unsupported));
    }

    #[test]
    fn test_set_blocklen_rejects_invalid() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        let r = card.do_command(16, 513).unwrap();
        assert_ne!(status_of(&r) & StatusFlags::BLOCK_LEN_ERROR.bits(), 0);
        assert_eq!(card.blocklen(), 512);
        // The error bit is sticky-cleared by the read.
        let r = card.do_command(13, u32::from(card.rca()) << 16).unwrap();
        assert_eq!(status_of(&r) & StatusFlags::BLOCK_LEN_ERROR.bits(), 0);
    }

    #[test]
    fn test_out_of_range_read_flags_and_stays() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        let r = card.do_command(17, 2 << 20).unwrap();
        assert_ne!(status_of(&r) & StatusFlags::OUT_OF_RANGE.bits(), 0);
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn test_pinned_multi_write_and_wr_block_count() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);

        card.do_command(23, 2).unwrap();
        card.do_command(25, 0).unwrap();
        assert_eq!(card.state(), CardState::Receive);
        let data = vec![0x5a; 2048];
        assert_eq!(card.write(&data), 1024);
        assert_eq!(card.state(), CardState::Transfer);

        // Read the first block back.
        card.do_command(17, 0).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(card.read(&mut buf), 512);
        assert_eq!(buf, [0x5a; 512]);

        // ACMD22 reports two well-written blocks.
        card.do_command(55, u32::from(card.rca()) << 16).unwrap();
        card.do_command(22, 0).unwrap();
        let mut count = [0u8; 4];
        assert_eq!(card.read(&mut count), 4);
        assert_eq!(u32::from_be_bytes(count), 2);
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn test_pin_voided_by_intervening_command() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        card.do_command(23, 1).unwrap();
        card.do_command(13, u32::from(card.rca()) << 16).unwrap();
        card.do_command(25, 0).unwrap();
        // Open-ended: a second block is still accepted.
        assert_eq!(card.write(&vec![0x11; 1024]), 1024);
        assert_eq!(card.state(), CardState::Receive);
        card.do_command(12, 0).unwrap();
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn test_open_ended_read_until_stop() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        card.do_command(18, 0).unwrap();
        let mut buf = [0u8; 512];
        for _ in 0..3 {
            assert_eq!(card.read(&mut buf), 512);
        }
        assert_eq!(card.state(), CardState::Data);
        card.do_command(12, 0).unwrap();
        assert_eq!(card.state(), CardState::Transfer);
        assert_eq!(card.read(&mut buf), 0);
    }

    #[test]
    fn test_write_protect_blocks_writes() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        card.do_command(28, 0).unwrap();
        let r = card.do_command(24, 0).unwrap();
        assert_ne!(status_of(&r) & StatusFlags::WP_VIOLATION.bits(), 0);
        assert_eq!(card.state(), CardState::Transfer);
        card.do_command(29, 0).unwrap();
        card.do_command(24, 0).unwrap();
        assert_eq!(card.state(), CardState::Receive);
    }

    #[test]
    fn test_timed_erase() {
        let (mut card, timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);

        card.do_command(24, 0).unwrap();
        assert_eq!(card.write(&[0u8; 512]), 512);

        card.do_command(32, 0).unwrap();
        card.do_command(33, 511).unwrap();
        let r = card.do_command(38, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::R1b);
        assert_eq!(card.state(), CardState::Program);

        assert!(timer.borrow_mut().take().is_some());
        card.timer_due();
        assert_eq!(card.state(), CardState::Transfer);

        card.do_command(17, 0).unwrap();
        let mut buf = [0u8; 512];
        card.read(&mut buf);
        assert_eq!(buf, [0xff; 512]);
    }

    #[test]
    fn test_erase_without_range_is_flagged() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        let r = card.do_command(38, 0).unwrap();
        assert_ne!(status_of(&r) & StatusFlags::ERASE_SEQ_ERROR.bits(), 0);
        assert_eq!(card.state(), CardState::Transfer);
    }

    struct Sink {
        got: RefCell<Vec<u8>>,
        packets: RefCell<usize>,
    }

    impl CardListener for Sink {
        fn receive(&self, data: &[u8]) {
            self.got.borrow_mut().extend_from_slice(data);
            *self.packets.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_autonomous_scr_transmission() {
        let (mut card, timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);

        let sink = Rc::new(Sink { got: RefCell::new(Vec::new()), packets: RefCell::new(0) });
        let handle: Rc<dyn CardListener> = sink.clone();
        card.add_listener(&handle, 4).unwrap();

        let other: Rc<dyn CardListener> =
            Rc::new(Sink { got: RefCell::new(Vec::new()), packets: RefCell::new(0) });
        assert!(matches!(
            card.add_listener(&other, 4),
            Err(ModelError::ListenerBusy)
        ));

        card.do_command(55, u32::from(card.rca()) << 16).unwrap();
        card.do_command(51, 0).unwrap();
        assert_eq!(card.state(), CardState::Data);

        // Drive the paced loop to completion: 8 SCR bytes in 4-byte packets.
        let mut fired = 0;
        while timer.borrow_mut().take().is_some() {
            card.timer_due();
            fired += 1;
            assert!(fired < 10, "transmission loop never terminated");
        }
        assert_eq!(sink.got.borrow().as_slice(), card.scr);
        assert_eq!(*sink.packets.borrow(), 2);
        assert_eq!(card.state(), CardState::Transfer);

        assert!(card.remove_listener(&handle));
    }

    #[test]
    fn test_dead_listener_stops_transmission() {
        let (mut card, timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);
        {
            let handle: Rc<dyn CardListener> =
                Rc::new(Sink { got: RefCell::new(Vec::new()), packets: RefCell::new(0) });
            card.add_listener(&handle, 64).unwrap();
            card.do_command(55, u32::from(card.rca()) << 16).unwrap();
            card.do_command(51, 0).unwrap();
        }
        // Listener dropped before the first packet fires.
        timer.borrow_mut().take().unwrap();
        card.timer_due();
        assert!(timer.borrow_mut().take().is_none());
    }

    #[test]
    fn test_spi_mode_switch_is_atomic() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        card.goto_spi_mode();

        let r = card.do_command(0, 0).unwrap();
        assert_eq!(r.as_bytes(), &[0x01]);

        // Native-only identification commands are gone.
        assert_eq!(card.do_command(2, 0), Err(CommandFault::Unsupported));
        assert_eq!(card.do_command(7, 0), Err(CommandFault::Unsupported));

        // CMD8 echoes in SPI framing.
        let r = card.do_command(8, 0x1aa).unwrap();
        assert_eq!(r.kind(), ResponseKind::SpiR7);
        assert_eq!(r.as_bytes(), &[0x01, 0x00, 0x00, 0x01, 0xaa]);

        // ACMD41 until ready; the card comes up selected.
        card.do_command(55, 0).unwrap();
        let r = card.do_command(41, 0x4000_0000 | 0x00ff_8000).unwrap();
        assert_eq!(r.as_bytes(), &[0x01]);
        clock.advance_us(10_000);
        card.do_command(55, 0).unwrap();
        let r = card.do_command(41, 0x4000_0000 | 0x00ff_8000).unwrap();
        assert_eq!(r.as_bytes(), &[0x00]);
        assert_eq!(card.state(), CardState::Transfer);

        // CMD58 reports the OCR with the power-up bit.
        let r = card.do_command(58, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::SpiR3);
        let ocr = u32::from_be_bytes(r.as_bytes()[1..5].try_into().unwrap());
        assert_ne!(ocr & OCR_POWER_UP, 0);

        // Register reads come back as inline data-block frames.
        let r = card.do_command(9, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::SpiRegBlock);
        assert_eq!(r.len(), 20);
        assert_eq!(&r.as_bytes()[2..18], card.csd());

        // CMD13 is two bytes in SPI.
        let r = card.do_command(13, 0).unwrap();
        assert_eq!(r.kind(), ResponseKind::SpiR2);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_mmc_init_with_host_assigned_rca() {
        let (mut card, _timer, clock) = test_card("auto_mmc", 1 << 20);
        card.do_command(0, 0).unwrap();
        let r = card.do_command(1, 0x00ff_8000).unwrap();
        assert_eq!(r.kind(), ResponseKind::R3);
        assert_eq!(status_of(&r) & OCR_POWER_UP, 0);
        clock.advance_us(10_000);
        card.do_command(1, 0x00ff_8000).unwrap();
        assert_eq!(card.state(), CardState::Ready);

        card.do_command(2, 0).unwrap();
        assert_eq!(card.do_command(3, 0), Err(CommandFault::AddressMismatch));
        card.do_command(3, 0xbeef << 16).unwrap();
        assert_eq!(card.rca(), 0xbeef);
        assert_eq!(card.state(), CardState::Standby);

        card.do_command(7, 0xbeef << 16).unwrap();
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn test_mmcplus_is_sector_addressed() {
        let (mut card, _timer, clock) = test_card("auto_mmcplus", 1 << 20);
        assert_eq!(card.capacity(), 1 << 20);
        card.do_command(0, 0).unwrap();
        card.do_command(1, 0x00ff_8000).unwrap();
        clock.advance_us(10_000);
        let r = card.do_command(1, 0x00ff_8000).unwrap();
        assert_ne!(status_of(&r) & OCR_HIGH_CAPACITY, 0);
        card.do_command(2, 0).unwrap();
        card.do_command(3, 1 << 16).unwrap();
        card.do_command(7, 1 << 16).unwrap();

        // Sector 1 is byte 512.
        card.do_command(24, 1).unwrap();
        card.write(&[0x77; 512]);
        card.do_command(17, 1).unwrap();
        let mut buf = [0u8; 512];
        card.read(&mut buf);
        assert_eq!(buf, [0x77; 512]);
    }

    #[test]
    fn test_cid_patching_distinguishes_cards() {
        // Same template, same size: the serials still differ.
        let (card_a, _t, _c) = test_card("auto_sd", 1 << 20);
        let (card_b, _t, _c) = test_card("auto_sd", 1 << 20);
        assert_ne!(card_a.cid(), card_b.cid());
        // Both carry valid trailers.
        assert_eq!(card_a.cid()[15] & 1, 1);
        assert_eq!(card_b.cid()[15] & 1, 1);
    }

    #[test]
    fn test_open_ended_read_stops_at_media_end() {
        let (mut card, _timer, clock) = test_card("auto_sd", 1 << 20);
        init_sd(&mut card, &clock);

        // Open-ended multi-block read starting at the last block.
        card.do_command(18, (1 << 20) - 512).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(card.read(&mut buf), 512);
        // Past the last block the data phase yields nothing and ends.
        assert_eq!(card.read(&mut buf), 0);
        assert_eq!(card.state(), CardState::Transfer);
        let r = card.do_command(13, u32::from(card.rca()) << 16).unwrap();
        assert_ne!(status_of(&r) & StatusFlags::OUT_OF_RANGE.bits(), 0);
    }

    #[test]
    fn test_spi_restart_clears_session_state() {
        let (mut card, _timer, clock) = test_card("Transcend1G", 1 << 20);
        init_sd(&mut card, &clock);
        card.do_command(16, 512).unwrap();
        assert_eq!(card.blocklen(), 512);
        card.do_command(23, 4).unwrap();
        card.do_command(32, 0).unwrap();
        card.do_command(33, 1023).unwrap();

        card.goto_spi_mode();
        // The session block length reverts to the CSD-derived default.
        assert_eq!(card.blocklen(), 1024);

        card.do_command(0, 0).unwrap();
        card.do_command(55, 0).unwrap();
        card.do_command(41, 0x00ff_8000).unwrap();
        clock.advance_us(10_000);
        card.do_command(55, 0).unwrap();
        card.do_command(41, 0x00ff_8000).unwrap();
        assert_eq!(card.state(), CardState::Transfer);

        // The erase range tagged before the restart is gone.
        let r = card.do_command(38, 0).unwrap();
        assert_ne!(r.as_bytes()[0] & 0x10, 0);
    }
}
