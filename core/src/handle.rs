//! Transfer handles: options plus lifecycle.
//!
//! # Design
//! A handle owns its option registry and only accepts changes while it is
//! `Configuring`. The executor moves it to `Running` and then to one terminal
//! state; `reset` brings a terminal handle back to `Configuring` with its
//! options intact. The handle's `HandleId` never changes.

use std::time::Duration;

use crate::error::TransferError;
use crate::http::TransferRequest;
use crate::options::{OptionKey, OptionRegistry, OptionValue};
use crate::types::{CancelToken, HandleId, TransferResult, TransferState};

/// One configurable transfer.
#[derive(Debug)]
pub struct TransferHandle {
    id: HandleId,
    options: OptionRegistry,
    state: TransferState,
    cancel: CancelToken,
    last_result: Option<TransferResult>,
}

impl Default for TransferHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferHandle {
    pub fn new() -> Self {
        Self {
            id: HandleId::new(),
            options: OptionRegistry::new(),
            state: TransferState::Configuring,
            cancel: CancelToken::new(),
            last_result: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn options(&self) -> &OptionRegistry {
        &self.options
    }

    pub fn set(&mut self, key: OptionKey, value: impl Into<OptionValue>) -> Result<(), TransferError> {
        self.ensure_configuring("set an option")?;
        self.options.set(key, value)
    }

    pub fn set_by_id(&mut self, id: u32, value: impl Into<OptionValue>) -> Result<(), TransferError> {
        self.ensure_configuring("set an option")?;
        self.options.set_by_id(id, value)
    }

    /// Apply options from a JSON object keyed by option name.
    pub fn apply_json(
        &mut self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), TransferError> {
        self.ensure_configuring("set an option")?;
        self.options.apply_json(doc)
    }

    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn unset(&mut self, key: OptionKey) -> Result<Option<OptionValue>, TransferError> {
        self.ensure_configuring("unset an option")?;
        Ok(self.options.remove(key))
    }

    /// A token that cancels this handle's transfer from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Result of the last transfer, until `reset`.
    pub fn last_result(&self) -> Option<&TransferResult> {
        self.last_result.as_ref()
    }

    pub fn response_code(&self) -> Option<u16> {
        self.last_result.as_ref().and_then(|r| r.response_code)
    }

    /// Back to `Configuring`, keeping options.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        if self.state == TransferState::Running {
            return Err(TransferError::InvalidState("cannot reset a running transfer".into()));
        }
        self.state = TransferState::Configuring;
        self.last_result = None;
        self.cancel.clear();
        Ok(())
    }

    /// A new `Configuring` handle with the same options and a fresh id.
    /// Callbacks are shared with this handle.
    pub fn duplicate(&self) -> TransferHandle {
        TransferHandle {
            options: self.options.clone(),
            ..TransferHandle::new()
        }
    }

    /// Check the handle can start and translate its options.
    pub(crate) fn prepare(&self, default_timeout: Option<Duration>) -> Result<TransferRequest, TransferError> {
        self.ensure_configuring("start")?;
        TransferRequest::from_options(&self.options, default_timeout)
    }

    pub(crate) fn begin(&mut self) {
        self.state = TransferState::Running;
    }

    pub(crate) fn finish(&mut self, result: TransferResult) {
        self.state = result.status.into();
        self.last_result = Some(result);
    }

    fn ensure_configuring(&self, action: &str) -> Result<(), TransferError> {
        if self.state == TransferState::Configuring {
            Ok(())
        } else {
            Err(TransferError::InvalidState(format!(
                "cannot {action} while the handle is {:?}",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferStatus;

    fn finished(status: TransferStatus) -> TransferResult {
        TransferResult {
            status,
            response_code: Some(200),
            body_bytes: 3,
            header_bytes: 20,
            upload_bytes: 0,
            elapsed: Duration::from_millis(1),
            error: None,
        }
    }

    #[test]
    fn start_without_url_keeps_configuring() {
        let handle = TransferHandle::new();
        assert!(matches!(handle.prepare(None), Err(TransferError::InvalidState(_))));
        assert_eq!(handle.state(), TransferState::Configuring);
    }

    #[test]
    fn options_are_frozen_outside_configuring() {
        let mut handle = TransferHandle::new();
        handle.set(OptionKey::Url, "http://a.test/").unwrap();
        handle.begin();
        assert!(matches!(
            handle.set(OptionKey::Verbose, true),
            Err(TransferError::InvalidState(_))
        ));
        assert!(matches!(handle.reset(), Err(TransferError::InvalidState(_))));

        handle.finish(finished(TransferStatus::Completed));
        assert_eq!(handle.state(), TransferState::Completed);
        assert!(handle.set(OptionKey::Verbose, true).is_err());
        assert!(handle.prepare(None).is_err());
    }

    #[test]
    fn reset_clears_negotiated_state_and_keeps_options() {
        let mut handle = TransferHandle::new();
        let id = handle.id();
        handle.set(OptionKey::Url, "http://a.test/").unwrap();
        handle.begin();
        handle.cancel();
        handle.finish(finished(TransferStatus::Cancelled));
        assert_eq!(handle.response_code(), Some(200));

        handle.reset().unwrap();
        assert_eq!(handle.state(), TransferState::Configuring);
        assert_eq!(handle.id(), id);
        assert_eq!(handle.last_result(), None);
        assert!(!handle.cancel_token().is_cancelled());
        assert_eq!(handle.options().get_str(OptionKey::Url), Some("http://a.test/"));
    }

    #[test]
    fn duplicate_gets_a_fresh_id() {
        let mut handle = TransferHandle::new();
        handle.set(OptionKey::Url, "http://a.test/").unwrap();
        handle.set(OptionKey::TimeoutMs, 250i64).unwrap();
        let copy = handle.duplicate();
        assert_ne!(copy.id(), handle.id());
        assert_eq!(copy.get(OptionKey::TimeoutMs), handle.get(OptionKey::TimeoutMs));
        assert_eq!(copy.state(), TransferState::Configuring);
    }
}
