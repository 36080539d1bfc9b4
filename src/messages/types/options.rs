use serde::{Deserialize, Serialize};

use super::{is_not, ClientRoles, URI};
use crate::Dict;

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct HelloDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    roles: ClientRoles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authmethods: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct WelcomeDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    #[serde(default)]
    roles: Dict,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct SubscribeOptions {}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    acknowledge: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct RegisterOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    pub receive_progress: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    pub receive_progress: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct CancelOptions {
    pub mode: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct YieldOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progress: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publisher: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    trustlevel: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<URI>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct InvocationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<URI>,

    #[serde(default, skip_serializing_if = "is_not")]
    pub receive_progress: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct InterruptOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct ResultDetails {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progress: bool,
}

impl HelloDetails {
    pub fn new(roles: ClientRoles) -> HelloDetails {
        HelloDetails {
            roles,
            agent: None,
            authid: None,
            authmethods: None,
        }
    }

    pub fn new_with_agent(roles: ClientRoles, agent: &str) -> HelloDetails {
        HelloDetails {
            roles,
            agent: Some(agent.to_string()),
            authid: None,
            authmethods: None,
        }
    }

    pub fn new_with_auth(roles: ClientRoles, authid: &str, authmethods: Vec<String>) -> HelloDetails {
        HelloDetails {
            roles,
            agent: None,
            authid: Some(authid.to_string()),
            authmethods: Some(authmethods),
        }
    }
}

impl WelcomeDetails {
    pub fn new(roles: Dict) -> WelcomeDetails {
        WelcomeDetails { roles, agent: None }
    }
}

impl ErrorDetails {
    pub fn new() -> ErrorDetails {
        ErrorDetails { message: None }
    }

    pub fn new_with_message(message: &str) -> ErrorDetails {
        ErrorDetails {
            message: Some(message.to_string()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl SubscribeOptions {
    pub fn new() -> SubscribeOptions {
        SubscribeOptions {}
    }
}

impl PublishOptions {
    pub fn new(acknowledge: bool) -> PublishOptions {
        PublishOptions { acknowledge }
    }

    pub fn should_acknowledge(&self) -> bool {
        self.acknowledge
    }
}

impl RegisterOptions {
    pub fn new() -> RegisterOptions {
        RegisterOptions {
            receive_progress: true,
        }
    }
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions {
            receive_progress: true,
        }
    }
}

impl CancelOptions {
    pub fn kill() -> CancelOptions {
        CancelOptions {
            mode: "kill".to_string(),
        }
    }
}

impl YieldOptions {
    pub fn new() -> YieldOptions {
        YieldOptions { progress: false }
    }

    pub fn progress() -> YieldOptions {
        YieldOptions { progress: true }
    }
}

impl EventDetails {
    pub fn new() -> EventDetails {
        EventDetails {
            publisher: None,
            trustlevel: None,
            topic: None,
        }
    }

    pub fn new_with_topic(topic: URI) -> EventDetails {
        EventDetails {
            publisher: None,
            trustlevel: None,
            topic: Some(topic),
        }
    }
}

impl InvocationDetails {
    pub fn new(receive_progress: bool) -> InvocationDetails {
        InvocationDetails {
            procedure: None,
            receive_progress,
        }
    }
}

impl ResultDetails {
    pub fn new() -> ResultDetails {
        ResultDetails { progress: false }
    }

    pub fn progress() -> ResultDetails {
        ResultDetails { progress: true }
    }
}
