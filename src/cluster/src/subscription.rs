//! Primary side of replication: one stream per (backup, queue) turning
//! local queue events into replication frames.

use log::{debug, warn};
use storage::{DurableQueue, PersistableQueue, Position, QueuedMessage};

use crate::error::{AttachError, HaError};
use crate::frame::{FrameBody, SessionFrame};
use crate::ha_broker::HaBroker;
use crate::membership::ClusterView;
use crate::transport::FrameTransport;
use crate::types::{MemberId, StartPoint, StreamId, StreamState};

/// Frames waiting to be submitted, each tagged with the stream it belongs to
pub type StreamFrames = Vec<(StreamId, SessionFrame)>;

/// Handle on a replication stream held in the cluster view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatingSubscription {
    id: StreamId,
    queue: String,
    peer: MemberId,
}

/// A freshly attached stream and the catch-up frames to send before any live traffic
#[derive(Debug)]
pub struct Attached {
    pub subscription: ReplicatingSubscription,
    pub backlog: StreamFrames,
}

impl ReplicatingSubscription {
    /// Open a stream for `peer` on `queue`.
    ///
    /// The caller holds the queue lock until the backlog is submitted so no
    /// live enqueue can overtake catch-up.
    pub fn attach(
        view: &mut ClusterView,
        queue: &DurableQueue,
        peer: &MemberId,
        start: StartPoint,
    ) -> Result<Attached, AttachError> {
        let role = view.local_role();
        if !role.is_primary() {
            return Err(AttachError::NotPrimary { role });
        }

        let name = queue.name().to_string();
        let tail = queue.tail();
        let head = queue.queue().peek().map(|m| m.position);

        let (backlog_messages, state) = match start {
            StartPoint::Tail => (Vec::new(), StreamState::Steady),
            StartPoint::After(low_water_mark) => {
                if low_water_mark > tail {
                    warn!(
                        "Peer {} is ahead on queue {} ({} > {}), streaming from {}",
                        peer, name, low_water_mark, tail, tail
                    );
                }
                (queue.messages_after(low_water_mark), StreamState::Catchup)
            }
        };

        let id = view.open_stream(&name, peer, tail, state)?;
        let mut backlog: StreamFrames = backlog_messages
            .into_iter()
            .map(|m| (id, enqueue_frame(&name, peer, &m)))
            .collect();
        backlog.push((
            id,
            SessionFrame::replication(FrameBody::ReplicaReady {
                queue: name.clone(),
                peer: peer.clone(),
                position: tail,
                head,
            }),
        ));

        debug!("Attached {} for {} on {} with {} backlog frames", id, peer, name, backlog.len());
        Ok(Attached {
            subscription: ReplicatingSubscription {
                id,
                queue: name,
                peer: peer.clone(),
            },
            backlog,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn peer(&self) -> &MemberId {
        &self.peer
    }

    pub fn is_active(&self, view: &ClusterView) -> bool {
        view.is_stream_open(self.id)
    }

    /// Catch-up has been submitted; the stream now follows the live tail.
    pub fn caught_up(&self, view: &mut ClusterView) {
        view.set_stream_state(self.id, StreamState::Steady);
    }

    /// Stop the stream. Safe to call more than once.
    pub fn detach(&self, view: &mut ClusterView) {
        view.close_stream(self.id, "detached");
    }

    /// Frames for a message just enqueued locally, one per open stream.
    /// A stream whose cursor would move backwards is closed instead.
    pub fn enqueue_frames(view: &mut ClusterView, queue: &str, message: &QueuedMessage) -> StreamFrames {
        let mut frames = Vec::new();
        for id in view.open_streams_for(queue) {
            if view.advance_cursor(id, message.position).is_err() {
                continue;
            }
            if let Some(stream) = view.stream(id) {
                frames.push((id, enqueue_frame(queue, &stream.peer, message)));
            }
        }
        frames
    }

    /// Frames for a message about to be dequeued locally. Only streams that
    /// already sent the message get a dequeue.
    pub fn dequeue_frames(view: &ClusterView, queue: &str, position: Position) -> StreamFrames {
        view.open_streams_for(queue)
            .into_iter()
            .filter_map(|id| view.stream(id))
            .filter(|stream| stream.cursor >= position)
            .map(|stream| {
                (
                    stream.id,
                    SessionFrame::replication(FrameBody::ReplicaDequeue {
                        queue: queue.to_string(),
                        peer: stream.peer.clone(),
                        position,
                    }),
                )
            })
            .collect()
    }

    /// Hand frames to the transport in order. A stream is checked for
    /// `Closed` right before each of its frames goes out; a transport failure
    /// closes the stream and fails the submission.
    pub async fn submit(
        ha: &HaBroker,
        transport: &dyn FrameTransport,
        from: &MemberId,
        frames: StreamFrames,
    ) -> Result<usize, HaError> {
        let mut sent = Vec::new();
        Self::submit_tracked(ha, transport, from, frames, &mut sent).await?;
        Ok(sent.len())
    }

    /// Like `submit`, recording in `sent` the stream of every frame that
    /// entered the transport, including when a later frame fails.
    pub async fn submit_tracked(
        ha: &HaBroker,
        transport: &dyn FrameTransport,
        from: &MemberId,
        frames: StreamFrames,
        sent: &mut Vec<StreamId>,
    ) -> Result<(), HaError> {
        for (id, frame) in frames {
            if !ha.lock().await.view.is_stream_open(id) {
                debug!("Skipping {} frame for closed {}", frame.body.name(), id);
                continue;
            }
            if let Err(e) = transport.broadcast(from, frame).await {
                warn!("Replication {} failed: {}", id, e);
                ha.lock().await.view.close_stream(id, "transport failure");
                return Err(e.into());
            }
            sent.push(id);
        }
        Ok(())
    }

    /// Dequeue frames withdrawing a message from the streams in `sent`,
    /// for an enqueue that failed part way through replication.
    pub fn retract_frames(view: &ClusterView, queue: &str, position: Position, sent: &[StreamId]) -> StreamFrames {
        Self::dequeue_frames(view, queue, position)
            .into_iter()
            .filter(|(id, _)| sent.contains(id))
            .collect()
    }
}

fn enqueue_frame(queue: &str, peer: &MemberId, message: &QueuedMessage) -> SessionFrame {
    SessionFrame::replication(FrameBody::ReplicaEnqueue {
        queue: queue.to_string(),
        peer: peer.clone(),
        position: message.position,
        body: message.body.clone(),
    })
}
