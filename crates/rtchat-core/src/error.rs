// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] rtchat_config::ConfigError),

    #[error("could not acquire an instance slot after {0} attempts")]
    InstanceAcquisitionFailed(u32),

    #[error("channel {0:?} is closed")]
    ChannelClosed(String),

    #[error("channel {0:?} did not open within {1} seconds")]
    ChannelOpenTimeout(String, u64),

    #[error("no handler registered for question topic {0:?}")]
    NoHandler(String),

    #[error("public key is already bound to {0:?}")]
    KeyAlreadyBound(Vec<String>),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("stored public key for {0:?} does not match the one presented")]
    PublicKeyChanged(String),

    #[error("peer {0:?} has not completed validation")]
    PeerUnverified(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("call already in progress with {0}")]
    CallInProgress(String),

    #[error("client already shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Store(e.to_string())
    }
}
