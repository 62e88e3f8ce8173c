//! Flash memory operation state machine
//!
//! Drives the port-3 four-step protocol: erase, write (start / data... /
//! finalize), and read (request / data...). Write offsets increase strictly
//! and the unacknowledged window stays within the instrument's receive
//! buffer; any out-of-sequence message aborts the operation with a
//! `sequence` error.

use tracing::{debug, warn};
use wattbus_core::error::Error;
use wattbus_wire::memory::MemoryMsg;

/// Bytes the instrument can buffer ahead of its acks
const WINDOW_DEFAULT: u32 = 4096;
/// Bytes per write-data chunk
const CHUNK_DEFAULT: u16 = 256;

/// Completion of one memory operation
#[derive(Debug, PartialEq, Eq)]
pub enum MemResult {
    /// Erase or write finished
    Done(Result<(), Error>),
    /// Read finished with the collected bytes
    ReadDone(Result<Vec<u8>, Error>),
}

enum State {
    Idle,
    Erasing {
        region: u8,
    },
    Writing {
        region: u8,
        data: Vec<u8>,
        sent: u32,
        acked: u32,
        finalize_sent: bool,
    },
    Reading {
        region: u8,
        next_offset: u32,
        length: u32,
        out: Vec<u8>,
    },
}

/// One in-progress memory operation per device
pub struct MemOps {
    state: State,
    window: u32,
    chunk: u16,
}

impl Default for MemOps {
    fn default() -> Self {
        Self {
            state: State::Idle,
            window: WINDOW_DEFAULT,
            chunk: CHUNK_DEFAULT,
        }
    }
}

impl MemOps {
    pub fn new(window: u32, chunk: u16) -> Self {
        Self {
            state: State::Idle,
            window,
            chunk: chunk.max(1),
        }
    }

    /// Whether an operation is in progress.
    pub fn is_busy(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Begin an erase.
    pub fn start_erase(&mut self, region: u8) -> Result<Vec<MemoryMsg>, Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        self.state = State::Erasing { region };
        Ok(vec![MemoryMsg::Erase { region }])
    }

    /// Begin a write; emits write-start plus the first window of chunks.
    pub fn start_write(&mut self, region: u8, data: Vec<u8>) -> Result<Vec<MemoryMsg>, Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        if data.is_empty() {
            return Err(Error::ParameterInvalid("empty write".into()));
        }
        let mut msgs = vec![MemoryMsg::WriteStart {
            region,
            size: data.len() as u32,
        }];
        let mut sent = 0;
        msgs.extend(fill_window(
            region,
            &data,
            &mut sent,
            0,
            self.window,
            self.chunk,
        ));
        self.state = State::Writing {
            region,
            data,
            sent,
            acked: 0,
            finalize_sent: false,
        };
        Ok(msgs)
    }

    /// Begin a read.
    pub fn start_read(
        &mut self,
        region: u8,
        offset: u32,
        length: u32,
    ) -> Result<Vec<MemoryMsg>, Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        if length == 0 {
            return Err(Error::ParameterInvalid("empty read".into()));
        }
        self.state = State::Reading {
            region,
            next_offset: offset,
            length,
            out: Vec::with_capacity(length as usize),
        };
        Ok(vec![MemoryMsg::ReadReq {
            region,
            offset,
            length,
        }])
    }

    /// Feed one inbound port-3 message; returns messages to send and the
    /// operation result once it completes (or aborts).
    pub fn on_msg(&mut self, msg: MemoryMsg) -> (Vec<MemoryMsg>, Option<MemResult>) {
        match msg {
            MemoryMsg::Ack {
                op, offset, status, ..
            } => self.on_ack(op, offset, status),
            MemoryMsg::ReadData { offset, data, .. } => self.on_read_data(offset, data),
            other => {
                warn!("unexpected memory message: {other:?}");
                (Vec::new(), None)
            }
        }
    }

    fn on_ack(&mut self, _op: u8, offset: u32, status: u8) -> (Vec<MemoryMsg>, Option<MemResult>) {
        if status != 0 {
            let err = Error::from_code(status).unwrap_or(Error::Io("memory ack".into()));
            return self.abort(err);
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Erasing { .. } => (Vec::new(), Some(MemResult::Done(Ok(())))),
            State::Writing {
                region,
                data,
                mut sent,
                acked,
                finalize_sent,
            } => {
                if finalize_sent {
                    // Finalize acknowledged: the write is committed.
                    return (Vec::new(), Some(MemResult::Done(Ok(()))));
                }
                // Write-data ack; committed offsets must advance.
                if (offset <= acked && acked != 0) || offset > sent {
                    debug!("memory ack out of sequence: {offset} (acked {acked}, sent {sent})");
                    return (Vec::new(), Some(MemResult::Done(Err(Error::Sequence))));
                }
                let acked = offset;
                let mut msgs = fill_window(region, &data, &mut sent, acked, self.window, self.chunk);
                let mut finalize_sent = false;
                if sent == data.len() as u32 && acked == sent {
                    finalize_sent = true;
                    msgs.push(MemoryMsg::WriteFinalize { region });
                }
                self.state = State::Writing {
                    region,
                    data,
                    sent,
                    acked,
                    finalize_sent,
                };
                (msgs, None)
            }
            other => {
                self.state = other;
                (Vec::new(), None)
            }
        }
    }

    fn on_read_data(&mut self, offset: u32, data: Vec<u8>) -> (Vec<MemoryMsg>, Option<MemResult>) {
        let State::Reading {
            next_offset,
            length,
            out,
            ..
        } = &mut self.state
        else {
            return (Vec::new(), None);
        };
        // Offsets must arrive strictly in order.
        if offset != *next_offset {
            debug!("read data out of sequence: {offset} != {next_offset}");
            return self.abort(Error::Sequence);
        }
        *next_offset += data.len() as u32;
        out.extend_from_slice(&data);
        if out.len() as u32 >= *length {
            let mut collected = std::mem::take(out);
            collected.truncate(*length as usize);
            self.state = State::Idle;
            return (Vec::new(), Some(MemResult::ReadDone(Ok(collected))));
        }
        (Vec::new(), None)
    }

    /// Abort the in-progress operation, reporting the taxon.
    fn abort(&mut self, err: Error) -> (Vec<MemoryMsg>, Option<MemResult>) {
        let result = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => return (Vec::new(), None),
            State::Reading { .. } => MemResult::ReadDone(Err(err)),
            _ => MemResult::Done(Err(err)),
        };
        (Vec::new(), Some(result))
    }
}

/// Queue write chunks while the unacked window allows.
fn fill_window(
    region: u8,
    data: &[u8],
    sent: &mut u32,
    acked: u32,
    window: u32,
    chunk: u16,
) -> Vec<MemoryMsg> {
    let mut msgs = Vec::new();
    while *sent < data.len() as u32 && *sent - acked < window {
        let offset = *sent;
        let end = (offset + u32::from(chunk)).min(data.len() as u32);
        msgs.push(MemoryMsg::WriteData {
            region,
            offset,
            data: data[offset as usize..end as usize].to_vec(),
        });
        *sent = end;
    }
    msgs
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP_WRITE_DATA: u8 = 3;
    const OP_WRITE_FINALIZE: u8 = 4;

    fn ack(op: u8, offset: u32) -> MemoryMsg {
        MemoryMsg::Ack {
            region: 0,
            op,
            offset,
            status: 0,
        }
    }

    #[test]
    fn test_erase_flow() {
        let mut ops = MemOps::default();
        let msgs = ops.start_erase(1).unwrap();
        assert_eq!(msgs, vec![MemoryMsg::Erase { region: 1 }]);
        assert!(ops.is_busy());
        assert!(ops.start_erase(2).is_err());

        let (out, result) = ops.on_msg(ack(1, 0));
        assert!(out.is_empty());
        assert_eq!(result, Some(MemResult::Done(Ok(()))));
        assert!(!ops.is_busy());
    }

    #[test]
    fn test_write_windowing_and_finalize() {
        let mut ops = MemOps::new(512, 256);
        let data = vec![0xABu8; 1024];
        let msgs = ops.start_write(0, data).unwrap();
        // Start + two 256-byte chunks fill the 512-byte window.
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], MemoryMsg::WriteStart { size: 1024, .. }));
        assert!(matches!(
            msgs[1],
            MemoryMsg::WriteData { offset: 0, .. }
        ));
        assert!(matches!(
            msgs[2],
            MemoryMsg::WriteData { offset: 256, .. }
        ));

        // Ack of the first chunk opens window for one more.
        let (out, result) = ops.on_msg(ack(OP_WRITE_DATA, 256));
        assert!(result.is_none());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], MemoryMsg::WriteData { offset: 512, .. }));

        let (out, _) = ops.on_msg(ack(OP_WRITE_DATA, 512));
        assert!(matches!(out[0], MemoryMsg::WriteData { offset: 768, .. }));

        let (out, result) = ops.on_msg(ack(OP_WRITE_DATA, 768));
        assert!(result.is_none());
        assert!(out.is_empty());

        // Final data ack: everything sent and acked, finalize goes out.
        let (out, result) = ops.on_msg(ack(OP_WRITE_DATA, 1024));
        assert!(result.is_none());
        assert_eq!(out, vec![MemoryMsg::WriteFinalize { region: 0 }]);

        let (_, result) = ops.on_msg(ack(OP_WRITE_FINALIZE, 1024));
        assert_eq!(result, Some(MemResult::Done(Ok(()))));
        assert!(!ops.is_busy());
    }

    #[test]
    fn test_write_ack_regression_is_sequence_error() {
        let mut ops = MemOps::new(512, 256);
        ops.start_write(0, vec![0u8; 1024]).unwrap();
        ops.on_msg(ack(OP_WRITE_DATA, 256));
        let (_, result) = ops.on_msg(ack(OP_WRITE_DATA, 128));
        assert_eq!(result, Some(MemResult::Done(Err(Error::Sequence))));
        assert!(!ops.is_busy(), "aborted operation cleans up");
    }

    #[test]
    fn test_read_flow() {
        let mut ops = MemOps::default();
        let msgs = ops.start_read(2, 128, 600).unwrap();
        assert_eq!(
            msgs,
            vec![MemoryMsg::ReadReq {
                region: 2,
                offset: 128,
                length: 600
            }]
        );

        let (_, result) = ops.on_msg(MemoryMsg::ReadData {
            region: 2,
            offset: 128,
            data: vec![1u8; 512],
        });
        assert!(result.is_none());

        let (_, result) = ops.on_msg(MemoryMsg::ReadData {
            region: 2,
            offset: 640,
            data: vec![2u8; 512],
        });
        match result {
            Some(MemResult::ReadDone(Ok(data))) => {
                assert_eq!(data.len(), 600);
                assert_eq!(data[0], 1);
                assert_eq!(data[599], 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_read_out_of_sequence_aborts() {
        let mut ops = MemOps::default();
        ops.start_read(0, 0, 1024).unwrap();
        let (_, result) = ops.on_msg(MemoryMsg::ReadData {
            region: 0,
            offset: 512, // skipped the first chunk
            data: vec![0u8; 512],
        });
        assert_eq!(result, Some(MemResult::ReadDone(Err(Error::Sequence))));
    }

    #[test]
    fn test_error_status_ack_aborts() {
        let mut ops = MemOps::default();
        ops.start_erase(0).unwrap();
        let (_, result) = ops.on_msg(MemoryMsg::Ack {
            region: 0,
            op: 1,
            offset: 0,
            status: Error::Integrity.code(),
        });
        assert_eq!(result, Some(MemResult::Done(Err(Error::Integrity))));
    }
}
