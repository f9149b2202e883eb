//! Moving one object from the source endpoint to the destination.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::batch::{ObjectSpec, Operation, SignedAction, TransferAction};
use crate::client::BatchApi;
use crate::config::RetryPolicy;
use crate::mapper::OidMapper;
use crate::oid::OidHasher;
use crate::{Error, Result};

const COPY_BUFFER: usize = 64 * 1024;

/// Run-wide cancellation flag.
///
/// A child token trips when either it or its parent is cancelled, which lets
/// one repository abort its own workers without touching the whole run.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }

    pub fn child(&self) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(self.flag.clone()),
        }
    }
}

/// How a successful transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Bytes were sent to the destination.
    Uploaded,
    /// The destination reported the object as already stored.
    AlreadyPresent,
    /// Downloaded and verified; upload suppressed.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct Transferred {
    pub object: ObjectSpec,
    pub outcome: TransferOutcome,
    pub attempts: u32,
}

/// Download, verify and upload for single objects.
pub struct TransferPipeline<'a> {
    source: &'a dyn BatchApi,
    destination: &'a dyn BatchApi,
    mapper: &'a OidMapper<'a>,
    retry: RetryPolicy,
    dry_run: bool,
    cancel: CancelToken,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(
        source: &'a dyn BatchApi,
        destination: &'a dyn BatchApi,
        mapper: &'a OidMapper<'a>,
        retry: RetryPolicy,
    ) -> Self {
        TransferPipeline {
            source,
            destination,
            mapper,
            retry,
            dry_run: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Move one object, retrying transient failures.
    ///
    /// `prefetched` is a download action from an earlier bulk request; it is
    /// used for the first attempt when it has not expired.
    pub fn transfer(
        &self,
        object: &ObjectSpec,
        prefetched: Option<TransferAction>,
    ) -> Result<Transferred> {
        let mut prefetched = prefetched;
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match self.attempt(object, prefetched.take()) {
                Ok(outcome) => {
                    if attempt > 1 {
                        tracing::info!(oid = %object.oid, attempts = attempt, "transfer succeeded after retries");
                    }
                    return Ok(Transferred {
                        object: object.clone(),
                        outcome,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        oid = %object.oid,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transfer failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(oid = %object.oid, attempts = attempt, error = %e, "transfer failed after all attempts");
                    return Err(Error::TransferFailed {
                        oid: object.hex(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt(&self, object: &ObjectSpec, prefetched: Option<TransferAction>) -> Result<TransferOutcome> {
        let download = match prefetched {
            Some(action) if action.is_fresh() => action,
            _ => single_action(self.source, Operation::Download, object)?,
        };
        let action = match download {
            TransferAction::Ready { action, .. } => action,
            rejected @ TransferAction::Rejected { .. } if rejected.is_not_found() => {
                return Err(Error::ObjectNotFound(object.hex()))
            }
            TransferAction::Rejected { code, message, .. } => {
                return Err(Error::Server { code, message })
            }
            TransferAction::Present { .. } => {
                return Err(Error::InvalidRequest(format!(
                    "source returned no download action for {}",
                    object.oid
                )))
            }
        };

        let mut spool = tempfile::tempfile()?;
        self.fetch_verified(object, &action, &mut spool)?;

        let target = self.mapper.map(object);
        if self.dry_run {
            tracing::info!(oid = %object.oid, size = object.size, "would upload verified object");
            return Ok(TransferOutcome::DryRun);
        }

        match single_action(self.destination, Operation::Upload, &target)? {
            TransferAction::Present { .. } => {
                self.mapper.mark_present(object);
                Ok(TransferOutcome::AlreadyPresent)
            }
            TransferAction::Rejected { code, message, .. } => Err(Error::Server { code, message }),
            TransferAction::Ready { action, verify, .. } => {
                if action.is_stale() {
                    return Err(Error::ActionExpired(0));
                }
                spool.seek(SeekFrom::Start(0))?;
                self.destination.upload(&action, &mut spool, target.size)?;
                if let Some(verify) = verify {
                    self.destination.verify(&verify, &target)?;
                }
                self.mapper.mark_present(object);
                tracing::debug!(oid = %object.oid, size = object.size, "uploaded object");
                Ok(TransferOutcome::Uploaded)
            }
        }
    }

    /// Stream the source bytes into `spool`, hashing as they pass.
    fn fetch_verified(&self, object: &ObjectSpec, action: &SignedAction, spool: &mut File) -> Result<()> {
        // One byte past the claimed size is enough to detect an oversized body.
        let mut reader = self.source.download(action)?.take(object.size + 1);
        let mut hasher = OidHasher::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            spool.write_all(&buf[..n])?;
        }
        spool.flush()?;

        let (actual, size) = hasher.finish();
        if actual != object.oid || size != object.size {
            tracing::error!(
                oid = %object.oid,
                actual = %actual,
                expected_size = object.size,
                actual_size = size,
                "source content does not match its oid"
            );
            return Err(Error::IntegrityMismatch {
                oid: object.hex(),
                actual_oid: actual.to_hex(),
                expected_size: object.size,
                actual_size: size,
            });
        }
        Ok(())
    }
}

fn single_action(api: &dyn BatchApi, operation: Operation, object: &ObjectSpec) -> Result<TransferAction> {
    let mut actions = api.request_actions(operation, std::slice::from_ref(object))?;
    actions.remove(&object.hex()).ok_or_else(|| Error::Server {
        code: 502,
        message: format!("{} response did not mention {}", operation, object.oid),
    })
}
