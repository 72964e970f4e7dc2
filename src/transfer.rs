//! The bulk data-transfer engine.
//!
//! A [`Transfer`] tracks the progress of exactly one data phase between a
//! command that opens it and the boundary (or stop command) that closes it.
//! Reads are pulled out in host-paced packets clipped to block boundaries;
//! writes are pushed in and committed to the backing store one whole block
//! at a time, so a packet split anywhere still commits on block boundaries.

use log::warn;

use crate::backing::{self, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    SingleRead,
    MultiRead,
    StreamRead,
    SingleWrite,
    MultiWrite,
    StreamWrite,
    /// A register image (SCR, SSR, switch status, written-block count)
    /// pushed over the data lines.
    RegisterRead,
    ProgramCid,
    ProgramCsd,
}

impl TransferKind {
    pub(crate) fn is_read(self) -> bool {
        matches!(
            self,
            TransferKind::SingleRead
                | TransferKind::MultiRead
                | TransferKind::StreamRead
                | TransferKind::RegisterRead
        )
    }
}

/// What one `push` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PushOutcome {
    /// Bytes taken from the packet. Shorter than the packet only when the
    /// transfer completed mid-packet.
    pub consumed: usize,
    /// Whole blocks committed to the backing store without error.
    pub committed: u64,
    pub done: bool,
}

pub(crate) struct Transfer {
    kind: TransferKind,
    /// Media byte address of the current block (or stream position).
    addr: u64,
    blocklen: u64,
    /// Bytes already moved within the current block.
    offset: u64,
    /// Whole blocks still to go; `None` until a stop command.
    remaining: Option<u64>,
    /// First byte address past the end of the medium; open-ended
    /// transfers terminate here.
    end: u64,
    hit_end: bool,
    /// Register payload (reads) or accumulation buffer (writes).
    staged: Vec<u8>,
    done: bool,
}

impl Transfer {
    pub(crate) fn media_read(
        kind: TransferKind,
        addr: u64,
        blocklen: u32,
        blocks: Option<u64>,
        media_end: u64,
    ) -> Transfer {
        Transfer {
            kind,
            addr,
            blocklen: u64::from(blocklen),
            offset: 0,
            remaining: blocks,
            end: media_end,
            hit_end: false,
            staged: Vec::new(),
            done: blocks == Some(0),
        }
    }

    pub(crate) fn media_write(
        kind: TransferKind,
        addr: u64,
        blocklen: u32,
        blocks: Option<u64>,
        media_end: u64,
    ) -> Transfer {
        let blocklen = u64::from(blocklen);
        Transfer {
            kind,
            addr,
            blocklen,
            offset: 0,
            remaining: blocks,
            end: media_end,
            hit_end: false,
            staged: Vec::with_capacity(blocklen as usize),
            done: blocks == Some(0),
        }
    }

    pub(crate) fn register_read(data: Vec<u8>) -> Transfer {
        Transfer {
            kind: TransferKind::RegisterRead,
            addr: 0,
            blocklen: data.len() as u64,
            offset: 0,
            remaining: Some(1),
            end: u64::MAX,
            hit_end: false,
            done: data.is_empty(),
            staged: data,
        }
    }

    /// A 16-byte register program (CMD26/CMD27).
    pub(crate) fn register_write(kind: TransferKind) -> Transfer {
        Transfer {
            kind,
            addr: 0,
            blocklen: 16,
            offset: 0,
            remaining: Some(1),
            end: u64::MAX,
            hit_end: false,
            staged: Vec::with_capacity(16),
            done: false,
        }
    }

    pub(crate) fn kind(&self) -> TransferKind {
        self.kind
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Terminate an open-ended transfer (CMD12). Partial blocks are
    /// discarded, matching a card that never got the block's CRC.
    pub(crate) fn stop(&mut self) {
        self.done = true;
    }

    /// The accumulated register bytes of a completed program transfer.
    pub(crate) fn take_staged(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.staged)
    }

    /// Whether the transfer terminated by running off the end of the
    /// medium.
    pub(crate) fn reached_media_end(&self) -> bool {
        self.hit_end
    }

    fn end_of_block(&mut self) {
        self.offset = 0;
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                self.done = true;
            }
        }
    }

    /// Produce up to `buf.len()` outgoing bytes, clipped to the current
    /// block boundary. Returns the byte count; zero once done.
    pub(crate) fn pull(&mut self, store: &mut dyn Storage, buf: &mut [u8]) -> usize {
        if self.done || buf.is_empty() {
            return 0;
        }
        match self.kind {
            TransferKind::RegisterRead => {
                let staged = &self.staged[self.offset as usize..];
                let n = buf.len().min(staged.len());
                buf[..n].copy_from_slice(&staged[..n]);
                self.offset += n as u64;
                if self.offset == self.blocklen {
                    self.end_of_block();
                }
                n
            }
            TransferKind::StreamRead => {
                if self.addr >= self.end {
                    self.hit_end = true;
                    self.done = true;
                    return 0;
                }
                let n = buf.len().min((self.end - self.addr) as usize);
                backing::read_filling(store, self.addr, &mut buf[..n]);
                self.addr += n as u64;
                n
            }
            TransferKind::SingleRead | TransferKind::MultiRead => {
                if self.addr >= self.end {
                    self.hit_end = true;
                    self.done = true;
                    return 0;
                }
                let left = (self.blocklen - self.offset) as usize;
                let n = buf.len().min(left);
                backing::read_filling(store, self.addr + self.offset, &mut buf[..n]);
                self.offset += n as u64;
                if self.offset == self.blocklen {
                    self.addr += self.blocklen;
                    self.end_of_block();
                }
                n
            }
            _ => 0,
        }
    }

    /// Absorb an incoming packet. Whole blocks are committed as their last
    /// byte arrives; a trailing partial block stays staged for the next
    /// packet.
    pub(crate) fn push(&mut self, store: &mut dyn Storage, data: &[u8]) -> PushOutcome {
        let mut out = PushOutcome::default();
        if self.done {
            out.done = true;
            return out;
        }
        match self.kind {
            TransferKind::ProgramCid | TransferKind::ProgramCsd => {
                let n = data.len().min(16 - self.staged.len());
                self.staged.extend_from_slice(&data[..n]);
                out.consumed = n;
                if self.staged.len() == 16 {
                    self.done = true;
                }
            }
            TransferKind::StreamWrite => {
                if self.addr >= self.end {
                    self.hit_end = true;
                    self.done = true;
                    out.done = true;
                    return out;
                }
                let n = data.len().min((self.end - self.addr) as usize);
                match store.write_at(self.addr, &data[..n]) {
                    Ok(_) => {}
                    Err(err) => warn!("stream write at 0x{:08x} failed: {err}", self.addr),
                }
                self.addr += n as u64;
                out.consumed = n;
            }
            TransferKind::SingleWrite | TransferKind::MultiWrite => {
                let mut data = data;
                while !data.is_empty() && !self.done {
                    if self.addr >= self.end {
                        self.hit_end = true;
                        self.done = true;
                        break;
                    }
                    let n = data.len().min((self.blocklen as usize) - self.staged.len());
                    self.staged.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    out.consumed += n;
                    if self.staged.len() == self.blocklen as usize {
                        match store.write_at(self.addr, &self.staged) {
                            Ok(n) if n as u64 == self.blocklen => out.committed += 1,
                            Ok(_) => warn!(
                                "block write at 0x{:08x} clipped at end of medium",
                                self.addr
                            ),
                            Err(err) => {
                                warn!("block write at 0x{:08x} failed: {err}", self.addr)
                            }
                        }
                        self.staged.clear();
                        self.addr += self.blocklen;
                        self.end_of_block();
                    }
                }
            }
            _ => {}
        }
        out.done = self.done;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemImage;

    #[test]
    fn test_single_read_clips_to_block() {
        let mut img = MemImage::from_vec((0..=255).cycle().take(2048).collect());
        let mut t = Transfer::media_read(TransferKind::SingleRead, 512, 512, Some(1), 2048);
        let mut buf = [0u8; 300];
        assert_eq!(t.pull(&mut img, &mut buf), 300);
        assert_eq!(buf[0], 0); // 512 % 256
        assert!(!t.is_done());
        assert_eq!(t.pull(&mut img, &mut buf), 212);
        assert!(t.is_done());
        assert_eq!(t.pull(&mut img, &mut buf), 0);
    }

    #[test]
    fn test_multi_write_commits_on_boundaries() {
        let mut img = MemImage::new(4096);
        let mut t = Transfer::media_write(TransferKind::MultiWrite, 0, 512, None, 4096);
        let out = t.push(&mut img, &[0xabu8; 700]);
        assert_eq!(out.consumed, 700);
        assert_eq!(out.committed, 1);
        assert!(!out.done);
        // Staged partial block not yet on the medium.
        assert_eq!(img.contents()[512], 0xff);
        let out = t.push(&mut img, &[0xabu8; 324]);
        assert_eq!(out.committed, 1);
        assert_eq!(&img.contents()[..1024], &[0xab; 1024]);
        t.stop();
        assert!(t.is_done());
    }

    #[test]
    fn test_bounded_write_refuses_excess() {
        let mut img = MemImage::new(4096);
        let mut t = Transfer::media_write(TransferKind::MultiWrite, 0, 512, Some(2), 4096);
        let out = t.push(&mut img, &[0x11u8; 2048]);
        assert_eq!(out.consumed, 1024);
        assert_eq!(out.committed, 2);
        assert!(out.done);
        assert_eq!(img.contents()[1024], 0xff);
    }

    #[test]
    fn test_open_ended_read_ends_at_media_boundary() {
        let mut img = MemImage::new(1024);
        let mut t = Transfer::media_read(TransferKind::MultiRead, 512, 512, None, 1024);
        let mut buf = [0u8; 512];
        assert_eq!(t.pull(&mut img, &mut buf), 512);
        assert!(!t.is_done());
        assert_eq!(t.pull(&mut img, &mut buf), 0);
        assert!(t.is_done());
        assert!(t.reached_media_end());
    }

    #[test]
    fn test_stream_read_clips_at_media_end() {
        let mut img = MemImage::new(1024);
        let mut t = Transfer::media_read(TransferKind::StreamRead, 768, 512, None, 1024);
        let mut buf = [0u8; 512];
        assert_eq!(t.pull(&mut img, &mut buf), 256);
        assert_eq!(t.pull(&mut img, &mut buf), 0);
        assert!(t.is_done());
        assert!(t.reached_media_end());
    }

    #[test]
    fn test_open_ended_write_stops_at_media_end() {
        let mut img = MemImage::new(1024);
        let mut t = Transfer::media_write(TransferKind::MultiWrite, 512, 512, None, 1024);
        let out = t.push(&mut img, &[0x42u8; 1024]);
        assert_eq!(out.consumed, 512);
        assert_eq!(out.committed, 1);
        assert!(out.done);
        assert!(t.reached_media_end());
    }

    #[test]
    fn test_register_read_staging() {
        let mut img = MemImage::new(16);
        let mut t = Transfer::register_read(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = [0u8; 5];
        assert_eq!(t.pull(&mut img, &mut buf), 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        assert_eq!(t.pull(&mut img, &mut buf), 3);
        assert_eq!(&buf[..3], &[6, 7, 8]);
        assert!(t.is_done());
    }

    #[test]
    fn test_program_register_accumulates_split_packets() {
        let mut img = MemImage::new(16);
        let mut t = Transfer::register_write(TransferKind::ProgramCid);
        assert!(!t.push(&mut img, &[0x10; 10]).done);
        let out = t.push(&mut img, &[0x20; 10]);
        assert_eq!(out.consumed, 6);
        assert!(out.done);
        let reg = t.take_staged();
        assert_eq!(reg.len(), 16);
        assert_eq!(&reg[..10], &[0x10; 10]);
        assert_eq!(&reg[10..], &[0x20; 6]);
    }
}
