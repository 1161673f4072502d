//! Wire types of the HTTP-API control plane. Every response carries
//! `{error_code, desp, data}` with `ERROR_CODE_SUCC` as the success sentinel.

use httpflv_server::SubSessionStat;
use serde::{Deserialize, Serialize};

use crate::group::PublisherKind;

pub const ERROR_CODE_SUCC: i32 = 0;
pub const DESP_SUCC: &str = "succ";
pub const ERROR_CODE_GROUP_NOT_FOUND: i32 = 1001;
pub const DESP_GROUP_NOT_FOUND: &str = "group not found";
pub const ERROR_CODE_SESSION_NOT_FOUND: i32 = 1002;
pub const DESP_SESSION_NOT_FOUND: &str = "session not found";
pub const ERROR_CODE_START_RELAY_PULL_FAIL: i32 = 2001;
pub const ERROR_CODE_START_RTP_PUB_FAIL: i32 = 2002;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResp<T: Serialize> {
    pub error_code: i32,
    pub desp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResp<T> {
    pub fn succ(data: T) -> Self {
        Self {
            error_code: ERROR_CODE_SUCC,
            desp: DESP_SUCC.to_string(),
            data: Some(data),
        }
    }

    pub fn succ_empty() -> Self {
        Self {
            error_code: ERROR_CODE_SUCC,
            desp: DESP_SUCC.to_string(),
            data: None,
        }
    }

    pub fn fail(error_code: i32, desp: &str) -> Self {
        Self {
            error_code,
            desp: desp.to_string(),
            data: None,
        }
    }

    pub fn is_succ(&self) -> bool {
        self.error_code == ERROR_CODE_SUCC
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatServerInfo {
    pub server_id: String,
    pub version: String,
    pub api_version: String,
    pub start_time_unix: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatPub {
    pub kind: PublisherKind,
    pub session_id: String,
    pub start_time_unix: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatSub {
    pub session_id: String,
    pub kind: String,
    pub start_tick: u64,
    pub stat: SubSessionStat,
    pub diff: SubSessionStat,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatPush {
    pub key: String,
    pub push_url: String,
    pub is_pushing: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatPull {
    pub pull_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatGroup {
    pub stream_name: String,
    pub app_name: String,
    pub publisher: Option<StatPub>,
    pub subscribers: Vec<StatSub>,
    pub pushes: Vec<StatPush>,
    pub pull: Option<StatPull>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlStartRelayPullReq {
    pub url: String,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CtrlStartRelayPullData {
    pub stream_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlStopRelayPullReq {
    pub stream_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CtrlStopRelayPullData {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlStartRelayPushReq {
    pub key: String,
    pub addr: String,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlStopRelayPushReq {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlKickSessionReq {
    pub stream_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlStartRtpPubReq {
    pub stream_name: String,
    #[serde(default)]
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CtrlStartRtpPubData {
    pub stream_name: String,
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_resp_json_shape() {
        let resp = ApiResp::succ(CtrlStartRelayPullData {
            stream_name: "s".to_string(),
            session_id: "RTMPPULL1".to_string(),
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error_code"], 0);
        assert_eq!(json["desp"], "succ");
        assert_eq!(json["data"]["stream_name"], "s");

        let resp = ApiResp::<()>::fail(ERROR_CODE_GROUP_NOT_FOUND, DESP_GROUP_NOT_FOUND);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error_code"], 1001);
        assert!(json.get("data").is_none());
    }
}
