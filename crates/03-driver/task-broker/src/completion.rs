//! Result words: how the broker answers a blocked requester.
//!
//! A requester allocates a word holding [`RESULT_PENDING`], posts its message
//! and parks on the word. The broker stores the outcome and wakes it. The
//! outcome must differ from the sentinel or the waiter would never notice, so
//! every code here is distinct from it and the broker refuses to store it.

use std::sync::atomic::Ordering;

use transport::wait::{wait_while_eq, wake_one};
use transport::LinearMemory;

use crate::{BrokerError, BrokerIoError, BrokerResult};

/// Initial value of every result word.
pub const RESULT_PENDING: i32 = -1;
/// Host I/O failed (including non-success HTTP statuses).
pub const RESULT_IO_ERROR: i32 = -2;
/// A read arrived while another read on the same stream was pending.
pub const RESULT_MULTIPLE_PENDING_READS: i32 = -3;
/// The stream id is unknown or already closed.
pub const RESULT_UNKNOWN_STREAM: i32 = -4;

/// Stores `value` in the result word at `result_ptr` and wakes its single
/// waiter.
pub fn signal(memory: &LinearMemory, result_ptr: u32, value: i32) -> BrokerResult<()> {
    if value == RESULT_PENDING {
        tracing::error!("refusing to complete result word {result_ptr} with the pending sentinel");
        return Err(BrokerError::protocol(
            "completion value equals the pending sentinel",
        ));
    }
    let word = memory.atomic_u32(result_ptr)?;
    word.store(value as u32, Ordering::Release);
    wake_one(word);
    Ok(())
}

/// Resets the result word at `result_ptr` to the pending sentinel.
pub fn reset(memory: &LinearMemory, result_ptr: u32) -> BrokerResult<()> {
    memory
        .atomic_u32(result_ptr)?
        .store(RESULT_PENDING as u32, Ordering::Release);
    Ok(())
}

/// Parks until the broker has answered, then returns the raw code.
pub fn wait_result(memory: &LinearMemory, result_ptr: u32) -> BrokerResult<i32> {
    let word = memory.atomic_u32(result_ptr)?;
    Ok(wait_while_eq(word, RESULT_PENDING as u32) as i32)
}

/// Maps a raw code to a success value or the error it stands for.
pub fn decode_result(code: i32) -> BrokerResult<u32> {
    match code {
        code if code >= 0 => Ok(code as u32),
        RESULT_IO_ERROR => Err(BrokerIoError::new("host i/o failed").into()),
        RESULT_MULTIPLE_PENDING_READS => Err(BrokerError::MultiplePendingReads),
        RESULT_UNKNOWN_STREAM => Err(BrokerError::UnknownStream),
        other => Err(BrokerError::protocol(format!("unexpected result code {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sentinel_is_never_stored() {
        let memory = LinearMemory::new(64).expect("memory");
        reset(&memory, 8).expect("reset");
        assert!(signal(&memory, 8, RESULT_PENDING).is_err());
        let raw = memory.atomic_u32(8).expect("word").load(Ordering::Acquire);
        assert_eq!(raw as i32, RESULT_PENDING);
    }

    #[test]
    fn waiter_sees_signalled_value() {
        let memory = Arc::new(LinearMemory::new(64).expect("memory"));
        reset(&memory, 16).expect("reset");
        let waiter = {
            let memory = Arc::clone(&memory);
            thread::spawn(move || wait_result(&memory, 16).expect("wait"))
        };
        signal(&memory, 16, 20).expect("signal");
        assert_eq!(waiter.join().expect("join"), 20);
    }

    #[test]
    fn codes_map_to_errors() {
        assert_eq!(decode_result(0).expect("eof"), 0);
        assert!(matches!(decode_result(RESULT_IO_ERROR), Err(BrokerError::Io(_))));
        assert!(decode_result(RESULT_MULTIPLE_PENDING_READS)
            .unwrap_err()
            .is_ownership_violation());
        assert!(matches!(
            decode_result(RESULT_UNKNOWN_STREAM),
            Err(BrokerError::UnknownStream)
        ));
        assert!(decode_result(-9).unwrap_err().is_protocol());
    }
}
