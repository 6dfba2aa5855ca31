use crate::chord::actor::ControlHandle;
use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::NUM_BITS;
use crate::error::ChordError;
use log::{debug, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

/// Order in which the finger maintainer refreshes finger indices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FingerSelection {
    #[default]
    RoundRobin,
    Random,
}

impl FingerSelection {
    fn next_index(&self, cursor: &mut usize) -> usize {
        match self {
            FingerSelection::RoundRobin => {
                let index = *cursor;
                *cursor = (*cursor + 1) % NUM_BITS;
                index
            }
            FingerSelection::Random => rand::rng().random_range(0..NUM_BITS),
        }
    }
}

/// One stabilize round for `digest`.
///
/// Notify is only sent once the GetPredecessor reply has been applied, so
/// it always reaches the corrected successor. Returns the predecessor the
/// successor reported.
pub async fn stabilize_once(
    handle: &ControlHandle,
    digest: Digest,
) -> Result<Option<RoutingInfo>, ChordError> {
    let predecessor = handle.get_predecessor(digest).await?;
    handle.notify(digest).await?;
    Ok(predecessor)
}

pub async fn run_stabilize_worker(
    handle: ControlHandle,
    digests: Vec<Digest>,
    period: Duration,
    cancel: CancellationToken,
) {
    info!("Starting stabilize worker for {:?}", digests);
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!("Running stabilize");
        for digest in &digests {
            match stabilize_once(&handle, *digest).await {
                Ok(_) => {}
                Err(ChordError::ActorStopped) => return,
                Err(e) => warn!("Stabilize of {} skipped: {}", digest, e),
            }
        }

        if handle.log_state().await.is_err() {
            break;
        }
    }
    info!("Stabilize worker stopped");
}

/// Refreshes every finger of `digest`, in index order
pub async fn fix_all_fingers(
    handle: &ControlHandle,
    digest: Digest,
) -> Result<Vec<Option<RoutingInfo>>, ChordError> {
    let mut fingers = Vec::with_capacity(NUM_BITS);
    for index in 0..NUM_BITS {
        fingers.push(handle.fix_finger(digest, index).await?);
    }
    Ok(fingers)
}

pub async fn run_finger_maintainer(
    handle: ControlHandle,
    digests: Vec<Digest>,
    period: Duration,
    selection: FingerSelection,
    cancel: CancellationToken,
) {
    info!("Starting finger maintainer ({:?})", selection);
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut cursor = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let index = selection.next_index(&mut cursor);
        debug!("Fixing finger table entry {}", index);

        for digest in &digests {
            match handle.fix_finger(*digest, index).await {
                Ok(Some(owner)) => debug!("Finger {} of {} is {}", index, digest, owner.digest),
                Ok(None) => {}
                Err(ChordError::ActorStopped) => return,
                Err(e) => warn!("Failed to fix finger {} of {}: {}", index, digest, e),
            }
        }
    }
    info!("Finger maintainer stopped");
}
