use crate::peer::link::LinkEvent;
use crate::peer::state::LinkSignal;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use webrtc::data_channel::RTCDataChannel;

/// общий обработчик data-channel: open/message/close уходят в очередь линка
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: UnboundedSender<LinkEvent>) {
    info!("Attaching data channel '{}'", dc.label());
    let _ = events.send(LinkEvent::Channel(dc.clone()));

    let open_events = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        info!("Data channel '{label}' opened");
        let _ = open_events.send(LinkEvent::Signal(LinkSignal::ChannelOpen));
        Box::pin(async {})
    }));

    let msg_events = events.clone();
    dc.on_message(Box::new(move |msg| {
        debug!("Received message, length: {}", msg.data.len());
        // транскрипт идёт как UTF-8 текст
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        let _ = msg_events.send(LinkEvent::Message(text));
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        info!("Data channel closed");
        let _ = events.send(LinkEvent::Signal(LinkSignal::ChannelClosed));
        Box::pin(async {})
    }));
}
