use crate::codec;
use crate::error::MapmergeError;
use crate::lot::{Format, Lot, MERGE_FORMAT};
use crate::merge::MergeTool;
use crate::store::ContentStoreLike;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Seam to the outbound side of the message bus. The connection stays owned
/// by the listener; a publisher borrowing it is lent to the pipeline for the
/// duration of one message.
pub trait PublisherLike {
    fn publish(&mut self, destination: &str, body: &[u8]) -> Result<(), MapmergeError>;
}

/// Records publishes instead of talking to a broker.
#[derive(Default)]
pub struct MockPublisher {
    pub sent: Vec<(String, Vec<u8>)>,
}

impl MockPublisher {
    pub fn new() -> Self {
        MockPublisher { sent: Vec::new() }
    }
}

impl PublisherLike for MockPublisher {
    fn publish(&mut self, destination: &str, body: &[u8]) -> Result<(), MapmergeError> {
        self.sent.push((destination.to_string(), body.to_vec()));
        Ok(())
    }
}

/// What gets published to the failure destination when a message cannot be
/// processed. `original_message` is the untouched inbound body, base64.
#[derive(Serialize)]
struct DiagnosticReport<'a> {
    kind: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<&'a str>,
    original_message: String,
}

/// Per-message processing: decode, merge every wafer in order, upload the
/// produced maps, re-encode, publish. Every failure is converted into a
/// diagnostic publication; nothing escapes to the listening loop.
pub struct Pipeline<S: ContentStoreLike> {
    store: S,
    merge: MergeTool,
    success_destination: String,
    failure_destination: String,
}

impl<S: ContentStoreLike> Pipeline<S> {
    pub fn new(
        store: S,
        merge: MergeTool,
        success_destination: impl Into<String>,
        failure_destination: impl Into<String>,
    ) -> Self {
        Pipeline {
            store,
            merge,
            success_destination: success_destination.into(),
            failure_destination: failure_destination.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Handle one inbound message to completion. The message is consumed
    /// either way: its outcome lands on the success or the failure
    /// destination, never back on the input queue.
    pub fn handle_message<P: PublisherLike>(&self, body: &[u8], publisher: &mut P) {
        match self.process(body, publisher) {
            Ok(lot_name) => info!(lot = %lot_name, "lot merged and republished"),
            Err(err) => {
                warn!(kind = err.kind(), %err, "failed to process lot message");
                let report = diagnostic(&err, body);
                if let Err(publish_err) =
                    publisher.publish(&self.failure_destination, report.as_bytes())
                {
                    // Nothing left to do but log; the listener will rebuild
                    // the connection if it is gone.
                    error!(%publish_err, "could not publish diagnostic report");
                }
            }
        }
    }

    fn process<P: PublisherLike>(
        &self,
        body: &[u8],
        publisher: &mut P,
    ) -> Result<String, MapmergeError> {
        let mut lot = codec::decode(body)?;
        info!(lot = %lot.name, wafers = lot.wafers.len(), "received lot");

        let process_step = lot
            .process_step()
            .ok_or_else(|| {
                MapmergeError::Decode(format!(
                    "lot {} carries no processStep configuration parameter",
                    lot.name
                ))
            })?
            .to_string();
        let lot_name = lot.name.clone();

        for wafer in &mut lot.wafers {
            self.merge.merge_wafer(&lot_name, &process_step, wafer, &self.store)?;
        }

        self.upload_new_maps(&mut lot)?;

        let encoded = codec::encode(&lot)?;
        publisher.publish(&self.success_destination, &encoded)?;
        Ok(lot_name)
    }

    /// Push every still-inline th01 format to the datastore and swap it to
    /// the assigned reference. Formats that already carry a reference are
    /// left alone, so re-running is a no-op.
    fn upload_new_maps(&self, lot: &mut Lot) -> Result<(), MapmergeError> {
        for wafer in &mut lot.wafers {
            for wafermap in &mut wafer.wafermaps {
                let Some(format) = wafermap.format_mut(MERGE_FORMAT) else {
                    continue;
                };
                if let Format::Inline(payload) = format {
                    let reference = self.store.put(payload)?;
                    debug!(%reference, "uploaded merged wafermap");
                    *format = Format::Referenced(reference);
                }
            }
        }
        Ok(())
    }
}

fn diagnostic(err: &MapmergeError, body: &[u8]) -> String {
    let (stdout, stderr) = match err {
        MapmergeError::MergeFailed { stdout, stderr, .. } => {
            (Some(stdout.as_str()), Some(stderr.as_str()))
        }
        _ => (None, None),
    };
    let report = DiagnosticReport {
        kind: err.kind(),
        message: err.to_string(),
        stdout,
        stderr,
        original_message: BASE64.encode(body),
    };
    serde_json::to_string(&report).unwrap_or_else(|_| err.to_string())
}
