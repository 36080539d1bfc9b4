use std::future::Future;
use std::pin::Pin;

use crate::Dict;

/// What a user-supplied challenge responder returns for a `CHALLENGE`: a
/// bare signature, or a signature paired with extra `AUTHENTICATE` details.
#[derive(Debug, Clone)]
pub enum ChallengeResponse {
    Signature(String),
    SignatureWithExtra(String, Dict),
}

impl From<String> for ChallengeResponse {
    fn from(sig: String) -> Self {
        ChallengeResponse::Signature(sig)
    }
}

impl From<&str> for ChallengeResponse {
    fn from(sig: &str) -> Self {
        ChallengeResponse::Signature(sig.to_string())
    }
}

impl From<(String, Dict)> for ChallengeResponse {
    fn from((sig, extra): (String, Dict)) -> Self {
        ChallengeResponse::SignatureWithExtra(sig, extra)
    }
}

type ChallengeFuture = Pin<Box<dyn Future<Output = ChallengeResponse> + Send>>;

/// Authentication configuration for `connect`. The responder is invoked once
/// per `CHALLENGE` the router sends (it MAY challenge more than once).
pub struct Auth {
    pub authid: String,
    pub authmethods: Vec<String>,
    responder: Box<dyn Fn(&str, &Dict) -> ChallengeFuture + Send + Sync>,
}

impl Auth {
    pub fn new<F, Fut, R>(authid: impl Into<String>, authmethods: Vec<String>, responder: F) -> Auth
    where
        F: Fn(&str, &Dict) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Into<ChallengeResponse>,
    {
        Auth {
            authid: authid.into(),
            authmethods,
            responder: Box::new(move |method, extra| {
                let fut = responder(method, extra);
                Box::pin(async move { fut.await.into() })
            }),
        }
    }

    pub(crate) async fn challenge(&self, method: &str, extra: &Dict) -> ChallengeResponse {
        (self.responder)(method, extra).await
    }
}
