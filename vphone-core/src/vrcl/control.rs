//! The command surface VRCL drives.

use std::sync::Arc;

use tracing::info;

use crate::call::{CallHandle, CallState, CallStateMask, Direction};
use crate::collab::properties::keys;
use crate::collab::{PropertyStore, VideoInput};
use crate::conference::ConferenceManager;
use crate::context::Context;
use crate::error::VpError;

use super::message::{Reply, VrclCommand, parse_switch};

/// Executes authenticated, non-handshake commands.
pub trait RemoteControl: Send + Sync {
    fn execute(&self, command: &VrclCommand) -> Result<Reply, VpError>;
}

/// [`RemoteControl`] over the conference manager, the property store and
/// the optional video input.
pub struct ConferenceRemote {
    manager: Arc<ConferenceManager>,
    properties: Arc<dyn PropertyStore>,
    video: Option<Arc<dyn VideoInput>>,
}

impl ConferenceRemote {
    pub fn new(manager: Arc<ConferenceManager>, context: &Context) -> Self {
        Self {
            manager,
            properties: Arc::clone(&context.properties),
            video: context.video.clone(),
        }
    }

    /// The addressed call, or the head call.
    fn target(&self, call: Option<u32>) -> Result<CallHandle, VpError> {
        match call {
            Some(index) => self.manager.call_get(index),
            None => self.manager.head_call(),
        }
        .ok_or(VpError::NoCall)
    }

    /// The addressed call, or the oldest one still ringing here.
    fn ringing(&self, call: Option<u32>) -> Result<CallHandle, VpError> {
        if call.is_some() {
            return self.target(call);
        }
        self.manager
            .calls()
            .into_iter()
            .find(|c| c.direction() == Direction::Incoming && c.state() == CallState::Connecting)
            .ok_or(VpError::NoCall)
    }

    fn video(&self) -> Result<&Arc<dyn VideoInput>, VpError> {
        self.video.as_ref().ok_or(VpError::NotSupported("video input"))
    }

    fn setting_get(&self, name: &str) -> Result<String, VpError> {
        let value = match name {
            keys::MAX_CALLS => self.manager.max_calls_get().to_string(),
            keys::AUTO_REJECT => switch(self.manager.auto_reject_get()).to_string(),
            keys::ALLOW_INCOMING_CALLS => {
                switch(self.manager.allow_incoming_calls_get()).to_string()
            }
            keys::LOCAL_NAME => self
                .properties
                .get(name)
                .unwrap_or_else(|| self.manager.identity().name.clone()),
            keys::LOCAL_NUMBER => self
                .properties
                .get(name)
                .unwrap_or_else(|| self.manager.identity().number.clone()),
            other => self
                .properties
                .get(other)
                .ok_or_else(|| VpError::Setting(format!("unknown setting {other}")))?,
        };
        Ok(value)
    }

    fn setting_set(&self, name: &str, value: &str) -> Result<(), VpError> {
        match name {
            keys::MAX_CALLS => {
                let max = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| VpError::InvalidParameter("max calls"))?;
                self.manager.max_calls_set(max)?;
            }
            keys::AUTO_REJECT => self.manager.auto_reject_set(parse_switch(value)?),
            keys::ALLOW_INCOMING_CALLS => {
                self.manager.allow_incoming_calls_set(parse_switch(value)?)
            }
            _ => {}
        }
        self.properties.set(name, value)?;
        info!(setting = name, %value, "setting changed remotely");
        Ok(())
    }

    fn status(&self) -> Reply {
        let identity = self.manager.identity();
        let head = self
            .manager
            .head_call()
            .map(|c| c.state().as_str())
            .unwrap_or(CallState::Idle.as_str());
        let mut reply = Reply::empty()
            .with_attr("state", head)
            .with_attr("calls", self.manager.call_objects_count_get(CallStateMask::LIVE))
            .with_attr("maxCalls", self.manager.max_calls_get())
            .with_attr("name", &identity.name)
            .with_attr("number", &identity.number);
        if let Some(video) = &self.video {
            reply = reply.with_attr("privacy", switch(video.privacy_get()));
        }
        reply
    }
}

fn switch(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}

impl RemoteControl for ConferenceRemote {
    fn execute(&self, command: &VrclCommand) -> Result<Reply, VpError> {
        match command {
            VrclCommand::Answer { call } => self.ringing(*call)?.answer()?,
            VrclCommand::Reject { call, reason } => self.ringing(*call)?.reject(*reason)?,
            VrclCommand::CallHangUp { call } => self.target(*call)?.hang_up()?,
            VrclCommand::CallDial(request) => {
                let call = self.manager.call_dial(request.clone())?;
                return Ok(Reply::empty().with_attr("call", call.index()));
            }
            VrclCommand::CallHold { call } => self.target(*call)?.hold()?,
            VrclCommand::CallResume { call } => self.target(*call)?.resume()?,
            VrclCommand::CallTransfer { call, dial_string } => {
                self.target(*call)?.transfer(dial_string)?
            }
            VrclCommand::CallBridgeDial { call, uri } => self.target(*call)?.bridge_dial(uri)?,
            VrclCommand::CallBridgeDisconnect { call } => {
                self.target(*call)?.bridge_disconnect()?
            }
            VrclCommand::TextMessageSend { call, text } => self.target(*call)?.text_send(text)?,
            VrclCommand::DtmfSend { call, digit } => self.target(*call)?.dtmf_send(*digit)?,
            VrclCommand::SettingGet { name } => {
                let value = self.setting_get(name)?;
                return Ok(Reply::text(value).with_attr("name", name));
            }
            VrclCommand::SettingSet { name, value } => self.setting_set(name, value)?,
            VrclCommand::StatusCheck => return Ok(self.status()),
            VrclCommand::VideoPrivacySet { enabled } => self.video()?.privacy_set(*enabled)?,
            VrclCommand::VideoPrivacyGet => {
                return Ok(Reply::text(switch(self.video()?.privacy_get())));
            }
            VrclCommand::Connect { .. }
            | VrclCommand::Validate { .. }
            | VrclCommand::ApiVersionGet { .. }
            | VrclCommand::ApiVersion(_)
            | VrclCommand::IsAlive
            | VrclCommand::IsAliveAck
            | VrclCommand::Unknown(_) => {
                return Err(VpError::ProtocolViolation("not a remote-control command"));
            }
        }
        Ok(Reply::empty())
    }
}
