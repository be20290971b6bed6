//! Typed VRCL commands and the acknowledgement vocabulary.
//!
//! Every command is one element whose name selects the handler. Commands
//! aimed at a call take an optional `call="N"` attribute; without it the
//! head call is used.
//!
//! ```text
//!   <CallDial method="Direct">5551234</CallDial>  -> <CallDialSuccess call="1"/>
//!   <CallTransfer>5559876</CallTransfer>          -> <CallTransferFail>NotTransferable</CallTransferFail>
//!   <Frobnicate/>                                 -> <FrobnicateFail>unknown command</FrobnicateFail>
//! ```

use crate::call::{DialMethod, DialRequest, RejectReason};
use crate::error::VpError;

use super::version::ApiVersion;
use super::xml::XmlElement;

// ── Wire names ───────────────────────────────────────────────────

pub mod names {
    pub const CONNECT: &str = "Connect";
    pub const CONNECT_ACK: &str = "ConnectAck";
    pub const VALIDATE: &str = "Validate";
    pub const VALIDATE_ACK: &str = "ValidateAck";
    pub const API_VERSION_GET: &str = "APIVersionGet";
    pub const API_VERSION: &str = "APIVersion";
    pub const IS_ALIVE: &str = "IsAlive";
    pub const IS_ALIVE_ACK: &str = "IsAliveAck";
    pub const ANSWER: &str = "Answer";
    pub const REJECT: &str = "Reject";
    pub const CALL_HANG_UP: &str = "CallHangUp";
    pub const CALL_DIAL: &str = "CallDial";
    pub const CALL_HOLD: &str = "CallHold";
    pub const CALL_RESUME: &str = "CallResume";
    pub const CALL_TRANSFER: &str = "CallTransfer";
    pub const CALL_BRIDGE_DIAL: &str = "CallBridgeDial";
    pub const CALL_BRIDGE_DISCONNECT: &str = "CallBridgeDisconnect";
    pub const TEXT_MESSAGE_SEND: &str = "TextMessageSend";
    pub const DTMF_SEND: &str = "DtmfSend";
    pub const SETTING_GET: &str = "SettingGet";
    pub const SETTING_SET: &str = "SettingSet";
    pub const STATUS_CHECK: &str = "StatusCheck";
    pub const VIDEO_PRIVACY_SET: &str = "VideoPrivacySet";
    pub const VIDEO_PRIVACY_GET: &str = "VideoPrivacyGet";

    pub const SUCCESS_SUFFIX: &str = "Success";
    pub const FAIL_SUFFIX: &str = "Fail";
}

// ── VrclCommand ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VrclCommand {
    Connect { key: String },
    Validate { password: String },
    /// Optionally carries the client's own version.
    ApiVersionGet { client: Option<ApiVersion> },
    ApiVersion(ApiVersion),
    IsAlive,
    IsAliveAck,
    Answer { call: Option<u32> },
    Reject { call: Option<u32>, reason: RejectReason },
    CallHangUp { call: Option<u32> },
    CallDial(DialRequest),
    CallHold { call: Option<u32> },
    CallResume { call: Option<u32> },
    CallTransfer { call: Option<u32>, dial_string: String },
    CallBridgeDial { call: Option<u32>, uri: String },
    CallBridgeDisconnect { call: Option<u32> },
    TextMessageSend { call: Option<u32>, text: String },
    DtmfSend { call: Option<u32>, digit: char },
    SettingGet { name: String },
    SettingSet { name: String, value: String },
    StatusCheck,
    VideoPrivacySet { enabled: bool },
    VideoPrivacyGet,
    Unknown(String),
}

impl VrclCommand {
    /// Interpret a parsed element. Unrecognised names become `Unknown`;
    /// a recognised name with a malformed payload is an error.
    pub fn from_element(el: &XmlElement) -> Result<Self, VpError> {
        use names::*;

        let call = call_attr(el)?;
        let text = el.text();
        let command = match el.name.as_str() {
            CONNECT => VrclCommand::Connect {
                key: text.to_string(),
            },
            VALIDATE => VrclCommand::Validate {
                password: text.to_string(),
            },
            API_VERSION_GET => VrclCommand::ApiVersionGet {
                client: if text.is_empty() {
                    None
                } else {
                    Some(text.parse()?)
                },
            },
            API_VERSION => VrclCommand::ApiVersion(text.parse()?),
            IS_ALIVE => VrclCommand::IsAlive,
            IS_ALIVE_ACK => VrclCommand::IsAliveAck,
            ANSWER => VrclCommand::Answer { call },
            REJECT => VrclCommand::Reject {
                call,
                reason: text.parse()?,
            },
            CALL_HANG_UP | "Hangup" | "HangUp" => VrclCommand::CallHangUp { call },
            CALL_DIAL => VrclCommand::CallDial(dial_request(el)?),
            CALL_HOLD => VrclCommand::CallHold { call },
            CALL_RESUME => VrclCommand::CallResume { call },
            CALL_TRANSFER => VrclCommand::CallTransfer {
                call,
                dial_string: text.to_string(),
            },
            CALL_BRIDGE_DIAL => VrclCommand::CallBridgeDial {
                call,
                uri: text.to_string(),
            },
            CALL_BRIDGE_DISCONNECT => VrclCommand::CallBridgeDisconnect { call },
            // Text is sent verbatim, surrounding whitespace included.
            TEXT_MESSAGE_SEND => VrclCommand::TextMessageSend {
                call,
                text: el.text.clone(),
            },
            DTMF_SEND => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(digit), None) => VrclCommand::DtmfSend { call, digit },
                    _ => return Err(VpError::InvalidParameter("dtmf digit")),
                }
            }
            SETTING_GET => VrclCommand::SettingGet {
                name: setting_name(el)?,
            },
            SETTING_SET => VrclCommand::SettingSet {
                name: setting_name(el)?,
                value: match el.child_text("Value") {
                    Some(value) => value.to_string(),
                    None => text.to_string(),
                },
            },
            STATUS_CHECK => VrclCommand::StatusCheck,
            VIDEO_PRIVACY_SET => VrclCommand::VideoPrivacySet {
                enabled: parse_switch(text)?,
            },
            VIDEO_PRIVACY_GET => VrclCommand::VideoPrivacyGet,
            other => VrclCommand::Unknown(other.to_string()),
        };
        Ok(command)
    }

    /// The element name this command travels under.
    pub fn wire_name(&self) -> &str {
        use names::*;

        match self {
            VrclCommand::Connect { .. } => CONNECT,
            VrclCommand::Validate { .. } => VALIDATE,
            VrclCommand::ApiVersionGet { .. } => API_VERSION_GET,
            VrclCommand::ApiVersion(_) => API_VERSION,
            VrclCommand::IsAlive => IS_ALIVE,
            VrclCommand::IsAliveAck => IS_ALIVE_ACK,
            VrclCommand::Answer { .. } => ANSWER,
            VrclCommand::Reject { .. } => REJECT,
            VrclCommand::CallHangUp { .. } => CALL_HANG_UP,
            VrclCommand::CallDial(_) => CALL_DIAL,
            VrclCommand::CallHold { .. } => CALL_HOLD,
            VrclCommand::CallResume { .. } => CALL_RESUME,
            VrclCommand::CallTransfer { .. } => CALL_TRANSFER,
            VrclCommand::CallBridgeDial { .. } => CALL_BRIDGE_DIAL,
            VrclCommand::CallBridgeDisconnect { .. } => CALL_BRIDGE_DISCONNECT,
            VrclCommand::TextMessageSend { .. } => TEXT_MESSAGE_SEND,
            VrclCommand::DtmfSend { .. } => DTMF_SEND,
            VrclCommand::SettingGet { .. } => SETTING_GET,
            VrclCommand::SettingSet { .. } => SETTING_SET,
            VrclCommand::StatusCheck => STATUS_CHECK,
            VrclCommand::VideoPrivacySet { .. } => VIDEO_PRIVACY_SET,
            VrclCommand::VideoPrivacyGet => VIDEO_PRIVACY_GET,
            VrclCommand::Unknown(name) => name,
        }
    }

    /// Build the element a client sends for this command.
    pub fn to_element(&self) -> XmlElement {
        let el = XmlElement::new(self.wire_name());
        match self {
            VrclCommand::Connect { key } => el.with_text(key.as_str()),
            VrclCommand::Validate { password } => el.with_text(password.as_str()),
            VrclCommand::ApiVersionGet { client } => match client {
                Some(version) => el.with_text(version.to_string()),
                None => el,
            },
            VrclCommand::ApiVersion(version) => el.with_text(version.to_string()),
            VrclCommand::IsAlive
            | VrclCommand::IsAliveAck
            | VrclCommand::StatusCheck
            | VrclCommand::VideoPrivacyGet
            | VrclCommand::Unknown(_) => el,
            VrclCommand::Answer { call }
            | VrclCommand::CallHangUp { call }
            | VrclCommand::CallHold { call }
            | VrclCommand::CallResume { call }
            | VrclCommand::CallBridgeDisconnect { call } => with_call(el, *call),
            VrclCommand::Reject { call, reason } => with_call(el, *call).with_text(reason.as_str()),
            VrclCommand::CallDial(request) => {
                let mut el = el
                    .with_attr("method", request.method.as_str())
                    .with_text(request.dial_string.as_str());
                if let Some(original) = &request.original_string {
                    el = el.with_attr("original", original);
                }
                if let Some(name) = &request.from_name_override {
                    el = el.with_attr("fromName", name);
                }
                if let Some(name) = &request.call_list_name {
                    el = el.with_attr("callListName", name);
                }
                el
            }
            VrclCommand::CallTransfer { call, dial_string } => {
                with_call(el, *call).with_text(dial_string.as_str())
            }
            VrclCommand::CallBridgeDial { call, uri } => with_call(el, *call).with_text(uri.as_str()),
            VrclCommand::TextMessageSend { call, text } => {
                with_call(el, *call).with_text(text.as_str())
            }
            VrclCommand::DtmfSend { call, digit } => with_call(el, *call).with_text(digit.to_string()),
            VrclCommand::SettingGet { name } => el.with_attr("name", name),
            VrclCommand::SettingSet { name, value } => {
                el.with_attr("name", name).with_text(value.as_str())
            }
            VrclCommand::VideoPrivacySet { enabled } => {
                el.with_text(if *enabled { "On" } else { "Off" })
            }
        }
    }
}

fn with_call(el: XmlElement, call: Option<u32>) -> XmlElement {
    match call {
        Some(index) => el.with_attr("call", index),
        None => el,
    }
}

fn call_attr(el: &XmlElement) -> Result<Option<u32>, VpError> {
    el.attr("call")
        .map(|v| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| VpError::InvalidParameter("call index"))
        })
        .transpose()
}

fn dial_request(el: &XmlElement) -> Result<DialRequest, VpError> {
    let mut request = DialRequest::new(el.text());
    if let Some(method) = el.attr("method") {
        request = request.with_method(method.parse()?);
    }
    if let Some(original) = el.attr("original") {
        request = request.with_original(original);
    }
    if let Some(name) = el.attr("fromName") {
        request = request.with_from_name(name);
    }
    if let Some(name) = el.attr("callListName") {
        request = request.with_call_list_name(name);
    }
    Ok(request)
}

fn setting_name(el: &XmlElement) -> Result<String, VpError> {
    let name = match el.attr("name") {
        Some(name) => name.trim(),
        None if el.children.is_empty() => el.text(),
        None => "",
    };
    if name.is_empty() {
        return Err(VpError::InvalidParameter("setting name"));
    }
    Ok(name.to_string())
}

/// Accepts `On/Off`, `true/false`, `1/0`, `yes/no`.
pub fn parse_switch(value: &str) -> Result<bool, VpError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(VpError::UnknownVariant {
            type_name: "switch",
            value: other.to_string(),
        }),
    }
}

// ── Acknowledgements ─────────────────────────────────────────────

/// Payload carried by a positive acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
}

impl Reply {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            attributes: Vec::new(),
            text: Some(text.into()),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }
}

/// `<{command}Success …/>`
pub fn success(command: &str, reply: Reply) -> XmlElement {
    let mut el = XmlElement::new(format!("{command}{}", names::SUCCESS_SUFFIX));
    el.attributes = reply.attributes;
    if let Some(text) = reply.text {
        el.text = text;
    }
    el
}

/// `<{command}Fail>reason</{command}Fail>`
pub fn failure(command: &str, reason: impl Into<String>) -> XmlElement {
    XmlElement::new(format!("{command}{}", names::FAIL_SUFFIX)).with_text(reason)
}

/// Split an acknowledgement name into (command, succeeded).
pub fn ack_of(name: &str) -> Option<(&str, bool)> {
    if let Some(command) = name.strip_suffix(names::SUCCESS_SUFFIX) {
        return Some((command, true));
    }
    name.strip_suffix(names::FAIL_SUFFIX)
        .map(|command| (command, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Result<VrclCommand, VpError> {
        VrclCommand::from_element(&XmlElement::parse(xml).unwrap())
    }

    #[test]
    fn call_commands_carry_optional_index() {
        assert_eq!(
            parse("<CallHangUp/>").unwrap(),
            VrclCommand::CallHangUp { call: None }
        );
        assert_eq!(
            parse(r#"<CallHold call="4"/>"#).unwrap(),
            VrclCommand::CallHold { call: Some(4) }
        );
        assert!(matches!(
            parse(r#"<CallHold call="x"/>"#),
            Err(VpError::InvalidParameter(_))
        ));
        assert_eq!(
            parse("<Hangup/>").unwrap(),
            VrclCommand::CallHangUp { call: None }
        );
    }

    #[test]
    fn dial_attributes_map_to_request() {
        let cmd = parse(r#"<CallDial method="Relay" fromName="Front Desk">5551234</CallDial>"#)
            .unwrap();
        let VrclCommand::CallDial(request) = cmd else {
            panic!("expected CallDial");
        };
        assert_eq!(request.method, DialMethod::RelayPhoneNumber);
        assert_eq!(request.dial_string, "5551234");
        assert_eq!(request.from_name_override.as_deref(), Some("Front Desk"));
    }

    #[test]
    fn client_elements_parse_back() {
        let commands = [
            VrclCommand::CallDial(
                DialRequest::new("5551234").with_method(DialMethod::DirectPhoneNumber),
            ),
            VrclCommand::Reject {
                call: Some(2),
                reason: RejectReason::Busy,
            },
            VrclCommand::SettingSet {
                name: "MaxCalls".into(),
                value: "2".into(),
            },
            VrclCommand::ApiVersionGet {
                client: Some(ApiVersion::new(1, 1)),
            },
            VrclCommand::VideoPrivacySet { enabled: true },
            VrclCommand::DtmfSend {
                call: None,
                digit: '#',
            },
        ];
        for command in commands {
            let el = command.to_element();
            assert_eq!(VrclCommand::from_element(&el).unwrap(), command);
        }
    }

    #[test]
    fn unknown_names_are_not_errors() {
        assert_eq!(
            parse("<Frobnicate/>").unwrap(),
            VrclCommand::Unknown("Frobnicate".into())
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(parse("<DtmfSend>12</DtmfSend>").is_err());
        assert!(parse("<VideoPrivacySet>maybe</VideoPrivacySet>").is_err());
        assert!(parse("<SettingGet/>").is_err());
        assert!(parse("<APIVersion>x</APIVersion>").is_err());
    }

    #[test]
    fn acknowledgement_names() {
        assert_eq!(
            success("CallDial", Reply::empty().with_attr("call", 1)).to_xml(),
            r#"<CallDialSuccess call="1"/>"#
        );
        assert_eq!(
            failure("CallTransfer", "NotTransferable").to_xml(),
            "<CallTransferFail>NotTransferable</CallTransferFail>"
        );
        assert_eq!(ack_of("CallDialSuccess"), Some(("CallDial", true)));
        assert_eq!(ack_of("CallTransferFail"), Some(("CallTransfer", false)));
        assert_eq!(ack_of("CallIncoming"), None);
    }
}
