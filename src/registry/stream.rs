//! Per-stream relay state
//!
//! A [`Stream`] ties one publisher to any number of subscribers. The
//! publisher's RTP is written unmodified into a shared local track that
//! every subscriber's peer connection sends from, and cloned into the
//! recorder. All mutable state sits behind one async mutex that is never
//! held across network I/O.

use std::sync::Arc;

use tokio::sync::Mutex;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Result, SignalError};
use crate::peer;
use crate::recording::{new_recorder, Recorder};
use crate::server::ServerConfig;
use crate::session::Client;
use crate::signal::{SignalMessage, Telemetry};

/// One relayed stream: publisher, fanout track, recorder, telemetry
pub struct Stream {
    id: String,
    config: Arc<ServerConfig>,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    publisher: Option<Arc<Client>>,
    /// Every registered subscriber, including ones still waiting for a track
    subscribers: Vec<Arc<Client>>,
    /// Subscribers that joined before the publisher produced a track
    pending: Vec<Arc<Client>>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    telemetry: Option<Telemetry>,
    recorder: Option<Arc<dyn Recorder>>,
}

impl Stream {
    pub fn new(id: impl Into<String>, config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            config,
            state: Mutex::new(StreamState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a publisher and wire its peer connection
    ///
    /// A stream carries at most one publisher; a second registration is
    /// rejected without disturbing the first.
    pub async fn register_publisher(self: &Arc<Self>, client: &Arc<Client>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.publisher.is_some() {
                return Err(SignalError::PublisherAlreadyConnected.into());
            }
            state.publisher = Some(client.clone());
        }

        let pc = peer::create_peer_connection().await?;
        peer::wire_observers(&pc, client);

        let stream = Arc::downgrade(self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let stream = stream.clone();
            Box::pin(async move {
                let Some(stream) = stream.upgrade() else {
                    return;
                };
                tracing::info!(
                    stream = %stream.id,
                    kind = %track.kind(),
                    ssrc = track.ssrc(),
                    "Received remote track from publisher"
                );
                stream.set_remote_track(track).await;
            })
        }));

        client.set_peer(pc);
        tracing::info!(stream = %self.id, session_id = client.id(), "Publisher registered");
        Ok(())
    }

    /// Attach a subscriber
    ///
    /// If the publisher's track already exists the subscriber gets an offer
    /// immediately; otherwise it parks in the pending list and is offered
    /// the track when one arrives. Cached telemetry is replayed either way.
    pub async fn register_subscriber(self: &Arc<Self>, client: &Arc<Client>) -> Result<()> {
        let pc = peer::create_peer_connection().await?;
        peer::wire_observers(&pc, client);
        client.set_peer(pc.clone());

        let (track, telemetry) = {
            let mut state = self.state.lock().await;
            state.subscribers.push(client.clone());
            let track = state.video_track.clone();
            if track.is_none() {
                state.pending.push(client.clone());
            }
            (track, state.telemetry.clone())
        };

        if let Some(track) = track {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            if let Err(e) = peer::prefer_h264(&pc, &sender).await {
                tracing::warn!(stream = %self.id, error = %e, "Failed to set codec preference");
            }
            client.send_offer().await?;
        }
        if let Some(telemetry) = telemetry {
            if let Err(e) = client.send_signal(&telemetry.to_signal()) {
                tracing::warn!(stream = %self.id, session_id = client.id(), error = %e, "Failed to replay telemetry");
            }
        }
        tracing::info!(stream = %self.id, session_id = client.id(), "Subscriber registered");
        Ok(())
    }

    /// Detach a client, releasing publisher state when it was the publisher
    pub async fn remove_client(&self, client: &Arc<Client>) {
        let recorder = {
            let mut state = self.state.lock().await;
            let mut recorder = None;
            if state
                .publisher
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, client))
            {
                state.publisher = None;
                state.video_track = None;
                state.telemetry = None;
                recorder = state.recorder.take();
                tracing::info!(stream = %self.id, "Publisher left, stream reset");
            }
            state.subscribers.retain(|s| !Arc::ptr_eq(s, client));
            state.pending.retain(|s| !Arc::ptr_eq(s, client));
            recorder
        };
        // Finalization hits the disk, keep it outside the lock
        if let Some(recorder) = recorder {
            recorder.close();
        }
    }

    /// Adopt the publisher's remote track: build the fanout track, swap the
    /// recorder, serve pending subscribers, and start the forwarding tasks
    async fn set_remote_track(self: &Arc<Self>, remote: Arc<TrackRemote>) {
        let codec = remote.codec().capability;
        let local = Arc::new(TrackLocalStaticRTP::new(
            codec.clone(),
            remote.id(),
            format!("{}-video", self.id),
        ));
        let recorder = new_recorder(
            &self.config.recordings_dir,
            &self.id,
            &codec,
            self.config.segment_duration,
        );
        self.adopt_video_track(local, recorder).await;

        let stream = self.clone();
        let track = remote.clone();
        tokio::spawn(async move { stream.forward_rtp(track).await });
        let stream = self.clone();
        tokio::spawn(async move { stream.request_keyframes(remote).await });
    }

    /// Install the fanout track and recorder, closing the previous recorder,
    /// and send every pending subscriber its one offer
    async fn adopt_video_track(
        &self,
        local: Arc<TrackLocalStaticRTP>,
        recorder: Option<Arc<dyn Recorder>>,
    ) {
        let (old_recorder, pending) = {
            let mut state = self.state.lock().await;
            let old = state.recorder.take();
            state.video_track = Some(local.clone());
            state.recorder = recorder;
            (old, std::mem::take(&mut state.pending))
        };
        if let Some(old) = old_recorder {
            old.close();
        }

        for subscriber in pending {
            let Some(pc) = subscriber.peer() else {
                continue;
            };
            let sender = match pc
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => sender,
                Err(e) => {
                    tracing::warn!(stream = %self.id, session_id = subscriber.id(), error = %e, "Failed to add track to subscriber");
                    continue;
                }
            };
            if let Err(e) = peer::prefer_h264(pc, &sender).await {
                tracing::warn!(stream = %self.id, error = %e, "Failed to set codec preference");
            }
            if let Err(e) = subscriber.send_offer().await {
                tracing::warn!(stream = %self.id, session_id = subscriber.id(), error = %e, "Failed to send offer to subscriber");
            }
        }
    }

    /// Pump RTP from the publisher into the fanout track and the recorder
    /// until the remote track ends
    async fn forward_rtp(&self, remote: Arc<TrackRemote>) {
        loop {
            let (packet, _) = match remote.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    tracing::info!(stream = %self.id, reason = %e, "Publisher track closed");
                    return;
                }
            };
            let (track, recorder) = {
                let state = self.state.lock().await;
                (state.video_track.clone(), state.recorder.clone())
            };
            if let Some(track) = track {
                if let Err(e) = track.write_rtp(&packet).await {
                    tracing::warn!(stream = %self.id, error = %e, "Failed to forward RTP packet");
                    return;
                }
            }
            if let Some(recorder) = recorder {
                recorder.push(&packet);
            }
        }
    }

    /// Nudge the publisher for a keyframe at a fixed interval so late
    /// joiners and fresh segments decode quickly
    async fn request_keyframes(&self, remote: Arc<TrackRemote>) {
        let mut interval = tokio::time::interval(self.config.keyframe_interval);
        loop {
            interval.tick().await;
            let publisher = self.state.lock().await.publisher.clone();
            let Some(pc) = publisher.as_ref().and_then(|p| p.peer()) else {
                return;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: remote.ssrc(),
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                tracing::warn!(stream = %self.id, error = %e, "Failed to send PLI");
            }
        }
    }

    /// Cache a telemetry sample and fan it out to every subscriber
    pub async fn update_telemetry(&self, telemetry: Telemetry) {
        let msg = telemetry.to_signal();
        let recipients = {
            let mut state = self.state.lock().await;
            state.telemetry = Some(telemetry);
            state.subscribers.clone()
        };
        for subscriber in recipients {
            if let Err(e) = subscriber.send_signal(&msg) {
                tracing::warn!(stream = %self.id, session_id = subscriber.id(), error = %e, "Failed to deliver telemetry");
            }
        }
    }

    /// Relay a subscriber's control message to the publisher
    pub async fn forward_to_publisher(
        &self,
        mut msg: SignalMessage,
        sender: &Arc<Client>,
    ) -> Result<()> {
        if msg.source.as_deref().unwrap_or("").is_empty() {
            msg.source = Some(sender.role().as_str().to_string());
        }
        let publisher = self.state.lock().await.publisher.clone();
        let publisher = publisher.ok_or(SignalError::PublisherNotConnected)?;
        publisher.send_signal(&msg)
    }

    /// Relay a publisher's control message to every other subscriber
    ///
    /// Delivery failures are logged per recipient; the first one is also
    /// returned so the sender learns something went wrong.
    pub async fn broadcast_to_subscribers(
        &self,
        mut msg: SignalMessage,
        sender: &Arc<Client>,
    ) -> Result<()> {
        if msg.source.as_deref().unwrap_or("").is_empty() {
            msg.source = Some(sender.role().as_str().to_string());
        }
        let recipients: Vec<Arc<Client>> = {
            let state = self.state.lock().await;
            state
                .subscribers
                .iter()
                .filter(|s| !Arc::ptr_eq(s, sender))
                .cloned()
                .collect()
        };

        let mut first_err = None;
        for subscriber in recipients {
            if let Err(e) = subscriber.send_signal(&msg) {
                tracing::warn!(stream = %self.id, session_id = subscriber.id(), error = %e, "Failed to deliver control message");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    #[cfg(test)]
    pub(crate) async fn has_publisher(&self) -> bool {
        self.state.lock().await.publisher.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::signal::SignalKind;
    use tokio_test::assert_ok;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    #[tokio::test]
    async fn test_single_publisher() {
        let stream = Stream::new("s", test_config());
        let (first, _rx1) = Client::new(1, Role::Publisher, stream.clone(), 4);
        let (second, _rx2) = Client::new(2, Role::Publisher, stream.clone(), 4);

        stream.register_publisher(&first).await.unwrap();
        let err = stream.register_publisher(&second).await.unwrap_err();
        assert_eq!(err.to_string(), "publisher already connected");

        // The losing client never displaced the winner
        stream.remove_client(&second).await;
        let state = stream.state.lock().await;
        assert!(state
            .publisher
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &first)));
    }

    #[tokio::test]
    async fn test_publisher_slot_freed_on_removal() {
        let stream = Stream::new("s", test_config());
        let (first, _rx1) = Client::new(1, Role::Publisher, stream.clone(), 4);
        stream.register_publisher(&first).await.unwrap();
        stream.remove_client(&first).await;

        let (second, _rx2) = Client::new(2, Role::Publisher, stream.clone(), 4);
        assert_ok!(stream.register_publisher(&second).await);
    }

    #[tokio::test]
    async fn test_subscriber_pends_without_track() {
        let stream = Stream::new("s", test_config());
        let (sub, mut rx) = Client::new(1, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&sub).await.unwrap();

        let state = stream.state.lock().await;
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.subscribers.len(), 1);
        drop(state);

        // No offer was generated
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_subscriber_offered_on_track_arrival() {
        let stream = Stream::new("s", test_config());
        let (sub, mut rx) = Client::new(1, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&sub).await.unwrap();
        assert!(rx.try_recv().is_err());

        let codec = RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            ..Default::default()
        };
        let local = Arc::new(TrackLocalStaticRTP::new(
            codec,
            "video".to_string(),
            "s-video".to_string(),
        ));
        stream.adopt_video_track(local, None).await;

        {
            let state = stream.state.lock().await;
            assert!(state.pending.is_empty());
            assert!(state.video_track.is_some());
        }

        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "sdp");
        assert_eq!(value["sdpType"], "offer");
        // Exactly one offer per pending subscriber
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_telemetry_cached_and_broadcast() {
        let stream = Stream::new("s", test_config());
        let (sub, mut rx) = Client::new(1, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&sub).await.unwrap();

        let mut msg = SignalMessage::telemetry();
        msg.latitude = Some(51.5);
        msg.longitude = Some(-0.1);
        let telemetry = Telemetry::from_signal(&msg).unwrap();
        stream.update_telemetry(telemetry).await;

        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "telemetry");
        assert_eq!(value["latitude"], 51.5);

        // A late subscriber gets the cached sample on registration
        let (late, mut late_rx) = Client::new(2, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&late).await.unwrap();
        let replay = late_rx.try_recv().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(replay.to_text().unwrap()).unwrap();
        assert_eq!(value["longitude"], -0.1);
    }

    #[tokio::test]
    async fn test_forward_without_publisher() {
        let stream = Stream::new("s", test_config());
        let (sub, _rx) = Client::new(1, Role::Subscriber, stream.clone(), 4);

        let mut msg = SignalMessage::telemetry();
        msg.kind = SignalKind::GcsCommand;
        msg.payload = Some(serde_json::json!({"action": "takeoff"}));
        let err = stream.forward_to_publisher(msg, &sub).await.unwrap_err();
        assert_eq!(err.to_string(), "publisher not connected");
    }

    #[tokio::test]
    async fn test_forward_defaults_source_to_role() {
        let stream = Stream::new("s", test_config());
        let (publisher, mut pub_rx) = Client::new(1, Role::Publisher, stream.clone(), 4);
        stream.register_publisher(&publisher).await.unwrap();

        let (sub, _rx) = Client::new(2, Role::Subscriber, stream.clone(), 4);
        let mut msg = SignalMessage::telemetry();
        msg.kind = SignalKind::GcsCommand;
        msg.payload = Some(serde_json::json!({"action": "land"}));
        stream.forward_to_publisher(msg, &sub).await.unwrap();

        let frame = pub_rx.try_recv().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "gcs_command");
        assert_eq!(value["source"], "subscriber");
        assert_eq!(value["payload"]["action"], "land");
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let stream = Stream::new("s", test_config());
        let (a, mut rx_a) = Client::new(1, Role::Subscriber, stream.clone(), 4);
        let (b, mut rx_b) = Client::new(2, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&a).await.unwrap();
        stream.register_subscriber(&b).await.unwrap();

        let mut msg = SignalMessage::telemetry();
        msg.kind = SignalKind::GcsCommandAck;
        msg.payload = Some(serde_json::json!({"ok": true}));
        stream.broadcast_to_subscribers(msg, &a).await.unwrap();

        assert!(rx_a.try_recv().is_err());
        let frame = rx_b.try_recv().unwrap();
        assert!(frame.to_text().unwrap().contains("gcs_command_ack"));
    }

    #[tokio::test]
    async fn test_remove_client_clears_membership() {
        let stream = Stream::new("s", test_config());
        let (sub, _rx) = Client::new(1, Role::Subscriber, stream.clone(), 4);
        stream.register_subscriber(&sub).await.unwrap();
        assert_eq!(stream.subscriber_count().await, 1);

        stream.remove_client(&sub).await;
        assert_eq!(stream.subscriber_count().await, 0);
        assert!(stream.state.lock().await.pending.is_empty());
    }
}
