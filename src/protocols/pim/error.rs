// SPDX-License-Identifier: Apache-2.0 OR MIT

use thiserror::Error;

use super::ifchannel::ChannelId;

/// Errors returned by PIM table operations that a caller can misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PimError {
    #[error("invalid source-group {0}: (S,*) is not a valid key")]
    InvalidSourceGroup(String),

    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("PIM is not enabled on interface '{0}'")]
    PimDisabled(String),

    #[error("a (*,G) update session is already open for {0}")]
    BatchInProgress(String),

    #[error("no (*,G) update session is open")]
    NoBatchInProgress,

    #[error("no interface channel with id {0}")]
    UnknownChannel(ChannelId),
}
