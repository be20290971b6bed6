//! Conference and video events as VRCL notifications.

use std::sync::Arc;

use crate::call::{CallEvent, DisconnectReason};
use crate::collab::VideoInput;
use crate::conference::{BridgeNotice, CallNotice, ConferenceManager, DtmfNotice, TextNotice};
use crate::signal::ConnectionSet;

use super::server::NotifyHandle;
use super::version::{ApiVersion, gates};
use super::xml::XmlElement;

pub fn call_event_name(event: CallEvent) -> &'static str {
    match event {
        CallEvent::Incoming => "CallIncoming",
        CallEvent::Dialing => "CallDialing",
        CallEvent::Ringing => "CallRinging",
        CallEvent::Connecting => "CallConnecting",
        CallEvent::Connected => "CallConnected",
        CallEvent::HeldLocal => "CallHeldLocal",
        CallEvent::HeldRemote => "CallHeldRemote",
        CallEvent::Resumed => "CallResumed",
        CallEvent::Disconnecting => "CallDisconnecting",
        CallEvent::Disconnected => "CallTerminated",
        CallEvent::TransferFailed => "CallTransferFail",
        CallEvent::CriticalError => "CallCriticalError",
    }
}

pub fn call_event_message(notice: &CallNotice) -> XmlElement {
    let call = &notice.call;
    let el = XmlElement::new(call_event_name(notice.event)).with_attr("call", call.index());
    match notice.event {
        CallEvent::Incoming => {
            let remote = call.remote();
            el.with_attr("name", remote.display_name)
                .with_attr("number", remote.phone_number)
        }
        CallEvent::Dialing => match call.dial_request() {
            Some(request) => el.with_attr("number", &request.dial_string),
            None => el,
        },
        CallEvent::Disconnected => {
            let reason = call.disconnect_reason().unwrap_or(DisconnectReason::Error);
            el.with_text(reason.code().to_string())
        }
        _ => el,
    }
}

pub fn text_message(notice: &TextNotice) -> XmlElement {
    XmlElement::new("TextMessageReceived")
        .with_attr("call", notice.call.index())
        .with_text(notice.text.as_str())
}

pub fn dtmf_message(notice: &DtmfNotice) -> XmlElement {
    XmlElement::new("DtmfReceived")
        .with_attr("call", notice.call.index())
        .with_text(notice.digit.to_string())
}

pub fn bridge_message(notice: &BridgeNotice) -> XmlElement {
    XmlElement::new("CallBridgeStatus")
        .with_attr("call", notice.call.index())
        .with_text(notice.status.as_str())
}

pub fn privacy_message(enabled: bool) -> XmlElement {
    XmlElement::new("VideoPrivacy").with_text(if enabled { "On" } else { "Off" })
}

/// Subscriptions forwarding events to a server. Dropping it unsubscribes.
pub struct VrclNotifier {
    subscriptions: ConnectionSet,
}

impl VrclNotifier {
    pub fn attach(
        server: NotifyHandle,
        manager: &ConferenceManager,
        video: Option<&Arc<dyn VideoInput>>,
    ) -> Self {
        let subscriptions = ConnectionSet::new();
        let signals = manager.signals();

        let to = server.clone();
        subscriptions.push(signals.call_event.connect(move |notice| {
            to.notify(call_event_message(notice), gates::CALL_EVENTS);
        }));
        let to = server.clone();
        subscriptions.push(signals.text_received.connect(move |notice| {
            to.notify(text_message(notice), gates::TEXT_MESSAGES);
        }));
        let to = server.clone();
        subscriptions.push(signals.dtmf_received.connect(move |notice| {
            to.notify(dtmf_message(notice), gates::DTMF);
        }));
        let to = server.clone();
        subscriptions.push(signals.bridge_changed.connect(move |notice| {
            to.notify(bridge_message(notice), gates::BRIDGE);
        }));
        if let Some(video) = video {
            let to = server;
            subscriptions.push(video.signals().privacy_changed.connect(move |enabled| {
                to.notify(privacy_message(*enabled), gates::VIDEO_PRIVACY);
            }));
        }

        Self { subscriptions }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Minimum version for a notification by element name.
pub fn gate_for(name: &str) -> ApiVersion {
    match name {
        "DtmfReceived" => gates::DTMF,
        "CallBridgeStatus" => gates::BRIDGE,
        "VideoPrivacy" => gates::VIDEO_PRIVACY,
        "TextMessageReceived" => gates::TEXT_MESSAGES,
        _ => gates::CALL_EVENTS,
    }
}
