use serde::{Deserialize, Serialize};

use super::is_not;

/// Roles and per-role features this client advertises in `HELLO.details.roles`.
#[derive(Serialize, Deserialize, PartialEq, Debug)]
pub struct ClientRoles {
    pub publisher: PublisherRole,
    pub subscriber: SubscriberRole,
    pub caller: CallerRole,
    pub callee: CalleeRole,
}

/**************************
          Roles
**************************/

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct PublisherRole {}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct SubscriberRole {}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
pub struct CallerRole {
    pub features: CallerFeatures,
}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
pub struct CalleeRole {
    pub features: CalleeFeatures,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct CallerFeatures {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progressive_call_results: bool,
    #[serde(default, skip_serializing_if = "is_not")]
    pub call_canceling: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct CalleeFeatures {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progressive_call_results: bool,
    #[serde(default, skip_serializing_if = "is_not")]
    pub call_canceling: bool,
}

/**************************
      Implementations
**************************/

impl ClientRoles {
    /// The feature set this crate actually implements: progressive call
    /// results and call cancellation on both the caller and callee sides.
    #[inline]
    pub fn new() -> ClientRoles {
        ClientRoles {
            publisher: PublisherRole {},
            subscriber: SubscriberRole {},
            caller: CallerRole {
                features: CallerFeatures {
                    progressive_call_results: true,
                    call_canceling: true,
                },
            },
            callee: CalleeRole {
                features: CalleeFeatures {
                    progressive_call_results: true,
                    call_canceling: true,
                },
            },
        }
    }
}

impl Default for ClientRoles {
    fn default() -> ClientRoles {
        ClientRoles::new()
    }
}
