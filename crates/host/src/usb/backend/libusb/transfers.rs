//! USB transfer execution
//!
//! Runs one submission with rusb's synchronous API. IN transfers on bulk and
//! interrupt endpoints are issued in short slices so a cancel request is seen
//! within one slice; OUT and control transfers run as a single call.

use super::device::HostDevice;
use crate::usb::device::Submission;
use protocol::{TransferKind, TransferStatus, UsbError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timeout for transfers submitted without one (5 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest single read while waiting on an IN endpoint
const READ_SLICE: Duration = Duration::from_millis(100);

/// Result of one executed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub status: TransferStatus,
    pub data: Vec<u8>,
    pub actual_length: usize,
}

impl Outcome {
    fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
            actual_length: 0,
        }
    }

    fn read(mut buffer: Vec<u8>, length: usize) -> Self {
        buffer.truncate(length);
        Self {
            status: TransferStatus::Completed,
            data: buffer,
            actual_length: length,
        }
    }

    fn written(length: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            data: Vec::new(),
            actual_length: length,
        }
    }
}

/// Execute a submission on the device
pub(crate) fn execute(host: &HostDevice, submission: &Submission, cancelled: &AtomicBool) -> Outcome {
    if cancelled.load(Ordering::Acquire) {
        return Outcome::failed(TransferStatus::Cancelled);
    }

    let outcome = match submission.kind {
        TransferKind::Control => execute_control(host, submission),
        TransferKind::Bulk | TransferKind::Interrupt if submission.direction_in() => {
            execute_read(host, submission, cancelled)
        }
        TransferKind::Bulk | TransferKind::Interrupt => execute_write(host, submission),
        TransferKind::Isochronous => {
            debug!(
                "Isochronous transfer of {} packets on {:#04x} not supported by the libusb backend",
                submission.packet_lengths.len(),
                submission.endpoint
            );
            Outcome::failed(TransferStatus::Failed(UsbError::NotSupported))
        }
    };

    if !outcome.status.is_success() && outcome.status != TransferStatus::Cancelled {
        warn!(
            "{:?} transfer on device {} endpoint {:#04x} failed: {:?}",
            submission.kind,
            host.uid(),
            submission.endpoint,
            outcome.status
        );
    }
    outcome
}

fn execute_control(host: &HostDevice, submission: &Submission) -> Outcome {
    let Some(setup) = submission.setup else {
        return Outcome::failed(TransferStatus::Failed(UsbError::InvalidParam));
    };
    let timeout = submission.timeout.unwrap_or(DEFAULT_TIMEOUT);

    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    let result = if setup.direction_in() {
        let mut buffer = vec![0u8; usize::from(setup.length)];
        host.with_handle(|handle| {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut buffer,
                timeout,
            )
        })
        .map(|length| Outcome::read(buffer, length))
    } else {
        host.with_handle(|handle| {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &submission.data,
                timeout,
            )
        })
        .map(Outcome::written)
    };

    result.unwrap_or_else(|e| Outcome::failed(map_rusb_error(e).into_status()))
}

fn execute_read(host: &HostDevice, submission: &Submission, cancelled: &AtomicBool) -> Outcome {
    let endpoint = submission.endpoint;
    let deadline = submission.timeout.map(|timeout| Instant::now() + timeout);
    let mut buffer = vec![0u8; submission.data.len()];

    loop {
        if cancelled.load(Ordering::Acquire) {
            return Outcome::failed(TransferStatus::Cancelled);
        }

        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Outcome::failed(TransferStatus::Timeout);
                }
                remaining.min(READ_SLICE)
            }
            None => READ_SLICE,
        };

        let result = host.with_handle(|handle| match submission.kind {
            TransferKind::Interrupt => handle.read_interrupt(endpoint, &mut buffer, slice),
            _ => handle.read_bulk(endpoint, &mut buffer, slice),
        });

        match result {
            Ok(length) => {
                debug!("Read {} bytes from endpoint {:#04x}", length, endpoint);
                return Outcome::read(buffer, length);
            }
            // no data yet, wait for another slice
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return Outcome::failed(map_rusb_error(e).into_status()),
        }
    }
}

fn execute_write(host: &HostDevice, submission: &Submission) -> Outcome {
    let endpoint = submission.endpoint;
    let timeout = submission.timeout.unwrap_or(DEFAULT_TIMEOUT);

    let result = host.with_handle(|handle| match submission.kind {
        TransferKind::Interrupt => handle.write_interrupt(endpoint, &submission.data, timeout),
        _ => handle.write_bulk(endpoint, &submission.data, timeout),
    });

    match result {
        Ok(length) => {
            debug!("Wrote {} bytes to endpoint {:#04x}", length, endpoint);
            Outcome::written(length)
        }
        Err(e) => Outcome::failed(map_rusb_error(e).into_status()),
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotSupported), UsbError::NotSupported);
        assert!(matches!(
            map_rusb_error(rusb::Error::Interrupted),
            UsbError::Other { .. }
        ));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(map_rusb_error(rusb::Error::Pipe).into_status(), TransferStatus::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice).into_status(), TransferStatus::Removed);
        assert_eq!(map_rusb_error(rusb::Error::Timeout).into_status(), TransferStatus::Timeout);
    }

    #[test]
    fn test_outcome_read_truncates() {
        let outcome = Outcome::read(vec![1, 2, 3, 4], 2);
        assert_eq!(outcome.data, vec![1, 2]);
        assert_eq!(outcome.actual_length, 2);
        assert!(outcome.status.is_success());
    }
}
