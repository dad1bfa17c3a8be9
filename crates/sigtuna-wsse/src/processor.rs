#![forbid(unsafe_code)]

//! The receive-side security header processor.
//!
//! One processor instance handles one header of one message. It walks the
//! header elements through the codec, populating the element store, firing
//! order-tracker events and recording token observations; once every element
//! has been read, decrypted and verified, it renders the end-of-run verdicts
//! (protection accounting, token consistency, supporting-token verification,
//! replay detection) and marks the header understood.
//!
//! Two pass strategies cover the two layouts senders produce. Strict walks
//! the stream once, processing each element as it appears; lax first reads
//! everything, then decrypts, then resolves derived-key stubs, then runs the
//! signature/encryption processing over the store in wire order. Both end in
//! the same `complete` step, so a header accepted under lax is accepted under
//! strict whenever its wire order happens to be strict.

use crate::codec::{DecryptedContent, HeaderSource, ParsedToken, SecurityHeaderCodec};
use crate::element::{
    BindingMode, ElementKind, ElementManager, ElementPayload, EncryptedDataElement,
    SignatureElement, TokenEntry,
};
use crate::order::{OrderTracker, ProtectionOrder};
use crate::tracker::{
    OperationTracker, SupportingTokenCategory, SupportingTokenSpec, TokenTracker,
};
use sigtuna_core::{AlgorithmSuite, Error, Result};
use sigtuna_tokens::{
    AggregateTokenResolver, AuthorizationPolicies, HeaderTokenResolver, KeyUnwrap, NonceCache,
    ReferenceStyle, SecurityTimestamp, SecurityToken, TokenAuthenticator, TokenResolver,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Wire layouts a sender may use for the security header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityHeaderLayout {
    /// Elements appear in processing order; everything is handled in one
    /// streaming pass.
    Strict,
    /// Elements may appear in any order; processing runs in layered passes
    /// over the collected header.
    Lax,
}

/// Which message parts a protection requirement covers.
#[derive(Debug, Clone, Default)]
pub struct ProtectionParts {
    pub is_body_included: bool,
    /// Header element kinds that must carry the protection.
    pub header_kinds: Vec<ElementKind>,
}

/// Per-token-kind binding parameters for the primary token.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenParameters {
    pub require_derived_keys: bool,
    pub has_asymmetric_key: bool,
}

/// Everything the binding configures about one receive.
pub struct ProcessorConfig {
    pub algorithm_suite: AlgorithmSuite,
    pub layout: SecurityHeaderLayout,
    pub protection_order: Option<ProtectionOrder>,
    pub require_message_protection: bool,

    pub expect_signature: bool,
    pub expect_encryption: bool,
    pub expect_signature_confirmation: bool,
    pub expect_basic_tokens: bool,
    pub expect_signed_tokens: bool,
    pub expect_endorsing_tokens: bool,
    pub expect_derived_key_tokens: bool,
    pub require_signed_primary_token: bool,
    pub encrypted_key_can_carry_reference_list: bool,
    pub enforce_derived_key_requirement: bool,

    pub replay_detection_enabled: bool,
    pub nonce_cache: Option<Arc<NonceCache>>,
    pub replay_window: chrono::Duration,
    pub clock_skew: chrono::Duration,

    pub primary_token_authenticator: Option<Arc<dyn TokenAuthenticator>>,
    pub out_of_band_primary_token: Option<Arc<SecurityToken>>,
    pub primary_token_parameters: Option<TokenParameters>,
    pub wrapping_token: Option<Arc<SecurityToken>>,
    pub expected_encryption_token: Option<Arc<SecurityToken>>,
    pub supporting_token_specs: Vec<Arc<SupportingTokenSpec>>,
    pub out_of_band_resolvers: Vec<Arc<dyn TokenResolver>>,
    pub key_unwrap: Option<Arc<dyn KeyUnwrap>>,
    pub required_signature_parts: Option<ProtectionParts>,
    pub required_encryption_parts: Option<ProtectionParts>,
}

impl ProcessorConfig {
    pub fn new(algorithm_suite: AlgorithmSuite) -> Self {
        ProcessorConfig {
            algorithm_suite,
            layout: SecurityHeaderLayout::Lax,
            protection_order: None,
            require_message_protection: false,
            expect_signature: false,
            expect_encryption: false,
            expect_signature_confirmation: false,
            expect_basic_tokens: false,
            expect_signed_tokens: false,
            expect_endorsing_tokens: false,
            expect_derived_key_tokens: false,
            require_signed_primary_token: false,
            encrypted_key_can_carry_reference_list: false,
            enforce_derived_key_requirement: true,
            replay_detection_enabled: false,
            nonce_cache: None,
            replay_window: chrono::Duration::minutes(5),
            clock_skew: chrono::Duration::minutes(5),
            primary_token_authenticator: None,
            out_of_band_primary_token: None,
            primary_token_parameters: None,
            wrapping_token: None,
            expected_encryption_token: None,
            supporting_token_specs: Vec::new(),
            out_of_band_resolvers: Vec::new(),
            key_unwrap: None,
            required_signature_parts: None,
            required_encryption_parts: None,
        }
    }
}

/// A signature value or confirmation value observed during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureValueEntry {
    pub value: Vec<u8>,
    pub from_decrypted_source: bool,
}

/// Everything a successful run hands back to the caller.
#[derive(Debug)]
pub struct ProcessedSecurityHeader {
    pub signature_token: Option<Arc<SecurityToken>>,
    pub encryption_token: Option<Arc<SecurityToken>>,
    pub timestamp: Option<SecurityTimestamp>,
    pub basic_supporting_tokens: Vec<Arc<SecurityToken>>,
    pub signed_supporting_tokens: Vec<Arc<SecurityToken>>,
    pub endorsing_supporting_tokens: Vec<Arc<SecurityToken>>,
    pub signed_endorsing_supporting_tokens: Vec<Arc<SecurityToken>>,
    /// `SignatureConfirmation` values received in this header.
    pub signature_confirmations: Vec<SignatureValueEntry>,
    /// Signature values seen in this header, kept for confirmation echo on
    /// the reply.
    pub received_signature_values: Vec<SignatureValueEntry>,
    pub primary_signature_value: Option<Vec<u8>>,
    pub token_policies: Vec<(Arc<SecurityToken>, AuthorizationPolicies)>,
}

/// Remaining-time accounting for the whole receive.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    deadline: Instant,
}

impl TimeBudget {
    pub fn new(timeout: Duration) -> Self {
        TimeBudget {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(Error::Timeout(
                "the time allotted to processing the security header has elapsed".into(),
            ));
        }
        Ok(self.deadline - now)
    }
}

pub struct SecurityHeaderProcessor<C: SecurityHeaderCodec> {
    codec: C,
    config: ProcessorConfig,
    store: ElementManager,
    order_tracker: OrderTracker,
    signature_tracker: OperationTracker,
    encryption_tracker: OperationTracker,
    primary_token_tracker: TokenTracker,
    supporting_trackers: Vec<TokenTracker>,
    universal_resolver: Arc<HeaderTokenResolver>,
    primary_resolver: Arc<HeaderTokenResolver>,
    combined_universal: Arc<AggregateTokenResolver>,
    combined_primary: Arc<AggregateTokenResolver>,
    wrapped_key_token: Option<Arc<SecurityToken>>,
    /// Data-reference ids announced by a reference list and not yet matched
    /// by a decrypted element.
    pending_reference_entries: Vec<String>,
    primary_signature_value: Option<Vec<u8>>,
    received_signature_values: Vec<SignatureValueEntry>,
    received_confirmations: Vec<SignatureValueEntry>,
    token_policies: Vec<(Arc<SecurityToken>, AuthorizationPolicies)>,
    derived_key_count: usize,
    max_derived_keys: usize,
    max_derived_key_length: usize,
    budget: TimeBudget,
    order_downgraded: bool,
    has_encrypted_basic_token: bool,
    primary_token_found: bool,
}

impl<C: SecurityHeaderCodec> SecurityHeaderProcessor<C> {
    pub fn new(codec: C, config: ProcessorConfig) -> Self {
        let universal_resolver = HeaderTokenResolver::new();
        let primary_resolver = HeaderTokenResolver::new();

        if let Some(wrapper) = &config.wrapping_token {
            universal_resolver.set_expected_wrapper(Arc::clone(wrapper));
            primary_resolver.set_expected_wrapper(Arc::clone(wrapper));
        }
        if let Some(token) = &config.out_of_band_primary_token {
            universal_resolver.add(Arc::clone(token), ReferenceStyle::External);
            primary_resolver.add(Arc::clone(token), ReferenceStyle::External);
        }
        if let Some(token) = &config.expected_encryption_token {
            universal_resolver.add(Arc::clone(token), ReferenceStyle::External);
            primary_resolver.add(Arc::clone(token), ReferenceStyle::External);
        }

        let combined_universal = AggregateTokenResolver::new(
            Arc::clone(&universal_resolver),
            config.out_of_band_resolvers.clone(),
            config.key_unwrap.clone(),
        );
        let combined_primary = AggregateTokenResolver::new(
            Arc::clone(&primary_resolver),
            config.out_of_band_resolvers.clone(),
            config.key_unwrap.clone(),
        );

        let primary_token_tracker = match &config.out_of_band_primary_token {
            Some(token) => TokenTracker::with_expected_token(
                Arc::clone(token),
                config.primary_token_authenticator.is_some(),
            ),
            None => TokenTracker::new(None),
        };

        let supporting_trackers = config
            .supporting_token_specs
            .iter()
            .map(|spec| TokenTracker::new(Some(Arc::clone(spec))))
            .collect();

        // One derivation each for signature and encryption, plus one per
        // supporting token required to derive; each may split into two
        // generations.
        let num_supporting_requiring_derivation = config
            .supporting_token_specs
            .iter()
            .filter(|s| s.require_derived_keys && !s.has_asymmetric_key)
            .count();
        let max_derived_keys = (1 + 1 + num_supporting_requiring_derivation) * 2;
        let max_derived_key_length = config.algorithm_suite.max_derived_key_length();

        // When the required encryption parts do not cover the body, an
        // encrypted-signature requirement cannot be met by compliant senders
        // that encrypted nothing; relax to plain sign-before-encrypt.
        let mut order_downgraded = false;
        let effective_order = match config.protection_order {
            Some(ProtectionOrder::SignBeforeEncryptAndEncryptSignature)
                if !config
                    .required_encryption_parts
                    .as_ref()
                    .is_some_and(|p| p.is_body_included) =>
            {
                order_downgraded = true;
                Some(ProtectionOrder::SignBeforeEncrypt)
            }
            other => other,
        };

        SecurityHeaderProcessor {
            codec,
            order_tracker: OrderTracker::new(effective_order),
            store: ElementManager::new(),
            signature_tracker: OperationTracker::new(),
            encryption_tracker: OperationTracker::new(),
            primary_token_tracker,
            supporting_trackers,
            universal_resolver,
            primary_resolver,
            combined_universal,
            combined_primary,
            wrapped_key_token: None,
            pending_reference_entries: Vec::new(),
            primary_signature_value: None,
            received_signature_values: Vec::new(),
            received_confirmations: Vec::new(),
            token_policies: Vec::new(),
            derived_key_count: 0,
            max_derived_keys,
            max_derived_key_length,
            budget: TimeBudget::new(Duration::from_secs(60)),
            order_downgraded,
            has_encrypted_basic_token: false,
            primary_token_found: false,
            config,
        }
    }

    /// Process one security header end to end.
    pub fn process<S>(mut self, source: &mut S, timeout: Duration) -> Result<ProcessedSecurityHeader>
    where
        S: HeaderSource<Raw = C::Raw>,
    {
        self.budget = TimeBudget::new(timeout);

        let mut raws = Vec::new();
        while let Some(raw) = source.next_element() {
            raws.push(raw);
        }
        debug!(
            elements = raws.len(),
            layout = ?self.config.layout,
            "processing security header"
        );

        match self.config.layout {
            SecurityHeaderLayout::Strict => self.execute_full_pass(raws)?,
            SecurityHeaderLayout::Lax => {
                self.execute_reading_pass(raws)?;
                self.execute_derived_key_stub_pass(false)?;
                self.execute_subheader_decryption_pass()?;
                self.execute_derived_key_stub_pass(true)?;
                self.execute_signature_encryption_processing_pass()?;
            }
        }

        let result = self.complete()?;
        source.mark_understood();
        Ok(result)
    }

    // ── passes ──────────────────────────────────────────────────────────

    /// Strict: one streaming pass, every element processed as it appears.
    fn execute_full_pass(&mut self, raws: Vec<C::Raw>) -> Result<()> {
        for raw in raws {
            self.budget.remaining()?;
            match self.codec.kind_of(&raw) {
                ElementKind::Signature => {
                    let sig = self.codec.read_signature(&raw)?;
                    let position = self
                        .store
                        .append(ElementPayload::Signature(sig.clone()), BindingMode::Unknown);
                    self.classify_and_process_signature(position, sig, false)?;
                }
                ElementKind::ReferenceList => {
                    let list = self.codec.read_reference_list(&raw)?;
                    self.register_reference_list(&list.data_references);
                    self.store
                        .append(ElementPayload::ReferenceList(list.clone()), BindingMode::Unknown);
                    self.process_reference_list_ids(&list.data_references, None)?;
                }
                ElementKind::Timestamp => self.read_timestamp(&raw)?,
                ElementKind::EncryptedKey => self.read_encrypted_key(&raw, true)?,
                ElementKind::EncryptedData => {
                    let data = self.codec.read_encrypted_data(&raw)?;
                    let position = self
                        .store
                        .append(ElementPayload::EncryptedData(data.clone()), BindingMode::Unknown);
                    self.process_encrypted_data(position, data, true)?;
                }
                ElementKind::Token => {
                    let parsed = self
                        .codec
                        .read_token(&raw, self.combined_universal.as_ref())?;
                    self.process_parsed_token(parsed, None, None, None, None, None, true)?;
                }
                ElementKind::SignatureConfirmation => self.read_signature_confirmation(&raw)?,
                ElementKind::TokenReference => {
                    let id = self.codec.read_token_reference(&raw)?;
                    self.store
                        .append(ElementPayload::TokenReference { id }, BindingMode::Unknown);
                }
            }
        }
        Ok(())
    }

    /// Lax pass 1: read and classify everything, defer all processing.
    fn execute_reading_pass(&mut self, raws: Vec<C::Raw>) -> Result<()> {
        for raw in raws {
            self.budget.remaining()?;
            match self.codec.kind_of(&raw) {
                ElementKind::Signature => {
                    let sig = self.codec.read_signature(&raw)?;
                    self.store
                        .append(ElementPayload::Signature(sig), BindingMode::Unknown);
                }
                ElementKind::ReferenceList => {
                    let list = self.codec.read_reference_list(&raw)?;
                    self.register_reference_list(&list.data_references);
                    self.store
                        .append(ElementPayload::ReferenceList(list), BindingMode::Unknown);
                }
                ElementKind::Timestamp => self.read_timestamp(&raw)?,
                ElementKind::EncryptedKey => self.read_encrypted_key(&raw, false)?,
                ElementKind::EncryptedData => {
                    let data = self.codec.read_encrypted_data(&raw)?;
                    self.store
                        .append(ElementPayload::EncryptedData(data), BindingMode::Unknown);
                }
                ElementKind::Token => {
                    let parsed = self
                        .codec
                        .read_token(&raw, self.combined_universal.as_ref())?;
                    self.process_parsed_token(parsed, None, None, None, None, None, false)?;
                }
                ElementKind::SignatureConfirmation => self.read_signature_confirmation(&raw)?,
                ElementKind::TokenReference => {
                    let id = self.codec.read_token_reference(&raw)?;
                    self.store
                        .append(ElementPayload::TokenReference { id }, BindingMode::Unknown);
                }
            }
        }
        Ok(())
    }

    /// Resolve derived-key stubs whose source has become visible. In the
    /// final pass an unresolved stub is fatal.
    fn execute_derived_key_stub_pass(&mut self, is_final: bool) -> Result<()> {
        for position in 0..self.store.len() {
            let stub = match self.store.get(position) {
                Some(entry) => match &entry.payload {
                    ElementPayload::Token(TokenEntry::Stub(stub)) => stub.clone(),
                    _ => continue,
                },
                None => continue,
            };
            match stub.try_resolve_source(self.combined_universal.as_ref()) {
                Some(source) => {
                    let token = self.materialize_derived_key(&stub, source)?;
                    self.store
                        .replace_payload(position, ElementPayload::Token(TokenEntry::Resolved(token)));
                }
                None if is_final => {
                    return Err(Error::Resolution(
                        "the source token of a derived key token could not be resolved".into(),
                    ));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Decrypt every `EncryptedData` still sitting in the store.
    fn execute_subheader_decryption_pass(&mut self) -> Result<()> {
        for position in 0..self.store.len() {
            let data = match self.store.get(position) {
                Some(entry) => match &entry.payload {
                    ElementPayload::EncryptedData(data) => data.clone(),
                    _ => continue,
                },
                None => continue,
            };
            self.process_encrypted_data(position, data, false)?;
        }
        Ok(())
    }

    /// Lax final pass: fire the order-tracker events and verify signatures in
    /// wire order over the (now fully decrypted) store.
    fn execute_signature_encryption_processing_pass(&mut self) -> Result<()> {
        for position in 0..self.store.len() {
            self.budget.remaining()?;
            let (payload, encrypted, mode) = match self.store.get(position) {
                Some(entry) => (
                    entry.payload.clone(),
                    entry.encrypted,
                    entry.binding_mode,
                ),
                None => continue,
            };
            match payload {
                ElementPayload::Signature(sig) => {
                    // signatures decrypted eagerly may already be classified
                    if mode == BindingMode::Unknown {
                        self.classify_and_process_signature(position, sig, encrypted)?;
                    }
                }
                ElementPayload::ReferenceList(list) => {
                    self.process_reference_list_ids(&list.data_references, None)?;
                }
                ElementPayload::EncryptedKey(token) => {
                    if let Some(ids) = token.reference_list().map(<[String]>::to_vec) {
                        self.process_reference_list_ids(&ids, Some(Arc::clone(&token)))?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── element readers ─────────────────────────────────────────────────

    fn read_timestamp(&mut self, raw: &C::Raw) -> Result<()> {
        if self.store.has_timestamp() {
            return Err(Error::Structure(
                "more than one timestamp in the security header".into(),
            ));
        }
        let timestamp = self.codec.read_timestamp(raw)?;
        timestamp.validate_freshness(Some(self.config.replay_window), self.config.clock_skew)?;
        self.store
            .append(ElementPayload::Timestamp(timestamp), BindingMode::Unknown);
        Ok(())
    }

    fn read_signature_confirmation(&mut self, raw: &C::Raw) -> Result<()> {
        if !self.config.expect_signature_confirmation {
            return Err(Error::Structure(
                "a signature confirmation was present but not expected".into(),
            ));
        }
        if self.order_tracker.primary_signature_done() {
            return Err(Error::Structure(
                "signature confirmations must precede the primary signature".into(),
            ));
        }
        let confirmation = self.codec.read_signature_confirmation(raw)?;
        self.received_confirmations.push(SignatureValueEntry {
            value: confirmation.value.clone(),
            from_decrypted_source: false,
        });
        self.store.append(
            ElementPayload::SignatureConfirmation(confirmation),
            BindingMode::Unknown,
        );
        Ok(())
    }

    fn read_encrypted_key(&mut self, raw: &C::Raw, process_now: bool) -> Result<()> {
        self.order_tracker.on_encrypted_key()?;
        let wrapped = self.codec.decrypt_wrapped_key(raw)?;

        // with no configured wrapping token the wrapped key is constrained
        // only by the end-of-run encryption-token consistency chain
        if let Some(expected) = &self.config.wrapping_token {
            let wrapper_matches = wrapped
                .wrapping_token()
                .is_some_and(|actual| SecurityToken::same_identity(expected, actual));
            if !wrapper_matches {
                return Err(Error::TokenConsistency(
                    "the wrapped key was not wrapped by the required wrapping token".into(),
                ));
            }
        }

        self.universal_resolver
            .add(Arc::clone(&wrapped), ReferenceStyle::Internal);
        self.primary_resolver
            .add(Arc::clone(&wrapped), ReferenceStyle::Internal);

        if let Some(ids) = wrapped.reference_list().map(<[String]>::to_vec) {
            if !self.config.encrypted_key_can_carry_reference_list {
                return Err(Error::Structure(
                    "a wrapped key carried a reference list but the binding does not allow one"
                        .into(),
                ));
            }
            self.wrapped_key_token = Some(Arc::clone(&wrapped));
            self.register_reference_list(&ids);
            if process_now {
                self.store
                    .append(ElementPayload::EncryptedKey(Arc::clone(&wrapped)), BindingMode::Primary);
                self.process_reference_list_ids(&ids, Some(wrapped))?;
                return Ok(());
            }
        }
        self.store
            .append(ElementPayload::EncryptedKey(wrapped), BindingMode::Primary);
        Ok(())
    }

    // ── reference lists and decryption ──────────────────────────────────

    fn register_reference_list(&mut self, ids: &[String]) {
        self.pending_reference_entries
            .extend(ids.iter().cloned());
    }

    fn delete_reference_list_entry(&mut self, id: &str) -> bool {
        match self
            .pending_reference_entries
            .iter()
            .position(|e| e == id)
        {
            Some(index) => {
                self.pending_reference_entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn process_reference_list_ids(
        &mut self,
        ids: &[String],
        wrapped_key: Option<Arc<SecurityToken>>,
    ) -> Result<()> {
        if !self.config.expect_encryption {
            return Err(Error::Structure(
                "a reference list was present but encryption was not expected".into(),
            ));
        }
        self.order_tracker.on_process_reference_list()?;
        if wrapped_key.is_some() && !self.config.encrypted_key_can_carry_reference_list {
            return Err(Error::Structure(
                "a wrapped key carried a reference list but the binding does not allow one".into(),
            ));
        }
        // Decrypt any referenced element already in the store; elements still
        // to come are decrypted on sight, and ids never matched at all are
        // caught when decryption completeness is checked.
        for id in ids {
            if let Some(position) = self.store.find_encrypted_data(id) {
                let data = match self.store.get(position) {
                    Some(entry) => match &entry.payload {
                        ElementPayload::EncryptedData(data) => data.clone(),
                        _ => continue,
                    },
                    None => continue,
                };
                self.process_encrypted_data(position, data, true)?;
            }
        }
        Ok(())
    }

    /// Decrypt one `EncryptedData` in place and dispatch on its content.
    fn process_encrypted_data(
        &mut self,
        position: usize,
        data: EncryptedDataElement,
        eager: bool,
    ) -> Result<()> {
        let reference_id = data.id.clone().or_else(|| data.wsu_id.clone());
        let referenced = reference_id
            .as_deref()
            .map_or(false, |id| self.pending_reference_entries.iter().any(|e| e == id));
        let wrapped_key = if referenced {
            self.wrapped_key_token.clone()
        } else {
            None
        };

        let content =
            self.codec
                .decrypt_element(&data, wrapped_key.as_ref(), self.combined_primary.as_ref())?;
        self.encryption_tracker
            .record_token(Arc::clone(&content.encryption_token))?;
        if let Some(id) = reference_id.as_deref() {
            self.delete_reference_list_entry(id);
        }

        let DecryptedContent {
            raw,
            encryption_token,
            buffer,
        } = content;

        match self.codec.kind_of(&raw) {
            ElementKind::Signature => {
                if !referenced {
                    return Err(Error::Structure(
                        "an encrypted signature was not covered by a reference list".into(),
                    ));
                }
                let sig = self.codec.read_signature(&raw)?;
                self.store.replace_after_decryption(
                    position,
                    ElementPayload::Signature(sig.clone()),
                    data.id.clone(),
                    data.wsu_id.clone(),
                    buffer,
                );
                if eager {
                    self.classify_and_process_signature(position, sig, true)?;
                }
                Ok(())
            }
            ElementKind::SignatureConfirmation => {
                if !referenced {
                    return Err(Error::Structure(
                        "an encrypted signature confirmation was not covered by a reference list"
                            .into(),
                    ));
                }
                if !self.config.expect_signature_confirmation {
                    return Err(Error::Structure(
                        "a signature confirmation was present but not expected".into(),
                    ));
                }
                let confirmation = self.codec.read_signature_confirmation(&raw)?;
                self.received_confirmations.push(SignatureValueEntry {
                    value: confirmation.value.clone(),
                    from_decrypted_source: true,
                });
                self.store.replace_after_decryption(
                    position,
                    ElementPayload::SignatureConfirmation(confirmation),
                    data.id.clone(),
                    data.wsu_id.clone(),
                    buffer,
                );
                Ok(())
            }
            ElementKind::EncryptedData => {
                // a doubly encrypted token: decrypt the inner layer too
                let inner = self.codec.read_encrypted_data(&raw)?;
                let inner_reference_id = inner.id.clone().or_else(|| inner.wsu_id.clone());
                let inner_content = self.codec.decrypt_element(
                    &inner,
                    wrapped_key.as_ref(),
                    self.combined_primary.as_ref(),
                )?;
                self.encryption_tracker
                    .record_token(Arc::clone(&inner_content.encryption_token))?;
                if let Some(id) = inner_reference_id.as_deref() {
                    self.delete_reference_list_entry(id);
                }
                if self.codec.kind_of(&inner_content.raw) != ElementKind::Token {
                    return Err(Error::Structure(
                        "a doubly encrypted element must contain a token".into(),
                    ));
                }
                let parsed = self
                    .codec
                    .read_token(&inner_content.raw, self.combined_universal.as_ref())?;
                // a signature may reference either encryption layer
                self.process_parsed_token(
                    parsed,
                    Some(position),
                    Some(inner_content.encryption_token),
                    data.id.clone().or_else(|| data.wsu_id.clone()),
                    inner_reference_id,
                    Some(inner_content.buffer),
                    eager,
                )?;
                self.store.set_double_encrypted(position);
                Ok(())
            }
            ElementKind::Token => {
                let parsed = self
                    .codec
                    .read_token(&raw, self.combined_universal.as_ref())?;
                self.process_parsed_token(
                    parsed,
                    Some(position),
                    Some(encryption_token),
                    data.id.clone(),
                    data.wsu_id.clone(),
                    Some(buffer),
                    eager,
                )
            }
            other => Err(Error::Structure(format!(
                "unexpected {other:?} element inside encrypted data"
            ))),
        }
    }

    // ── tokens ──────────────────────────────────────────────────────────

    fn ensure_derived_key_limit_not_reached(&mut self) -> Result<()> {
        if !self.config.expect_derived_key_tokens {
            return Err(Error::Structure(
                "a derived key token was present but not expected".into(),
            ));
        }
        self.derived_key_count += 1;
        if self.derived_key_count > self.max_derived_keys {
            return Err(Error::DerivedKeyQuota(format!(
                "more than {} derived key tokens in one security header",
                self.max_derived_keys
            )));
        }
        Ok(())
    }

    fn materialize_derived_key(
        &mut self,
        stub: &sigtuna_tokens::DerivedKeyStub,
        source: Arc<SecurityToken>,
    ) -> Result<Arc<SecurityToken>> {
        self.ensure_derived_key_limit_not_reached()?;
        let token = stub.create_token(source, self.max_derived_key_length)?;
        self.universal_resolver
            .add(Arc::clone(&token), ReferenceStyle::Internal);
        if self.is_primary_relevant(&token.root_token()) {
            self.primary_resolver
                .add(Arc::clone(&token), ReferenceStyle::Internal);
        }
        Ok(token)
    }

    fn is_primary_relevant(&self, root: &Arc<SecurityToken>) -> bool {
        let candidates = [
            self.wrapped_key_token.as_ref(),
            self.config.out_of_band_primary_token.as_ref(),
            self.config.expected_encryption_token.as_ref(),
            self.primary_token_tracker.token.as_ref(),
        ];
        candidates
            .into_iter()
            .flatten()
            .any(|t| SecurityToken::same_identity(t, root))
    }

    /// The authenticators a token read right now may be validated against.
    /// A supporting authenticator that is also the primary authenticator is
    /// withheld until the primary token has been found.
    fn allowed_authenticators(&self) -> Vec<(Arc<dyn TokenAuthenticator>, bool)> {
        let mut allowed: Vec<(Arc<dyn TokenAuthenticator>, bool)> = Vec::new();
        if let Some(primary) = &self.config.primary_token_authenticator {
            if !self.primary_token_found {
                allowed.push((Arc::clone(primary), true));
            }
        }
        for spec in &self.config.supporting_token_specs {
            let shadows_primary = !self.primary_token_found
                && self
                    .config
                    .primary_token_authenticator
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, &spec.authenticator));
            if !shadows_primary {
                allowed.push((Arc::clone(&spec.authenticator), false));
            }
        }
        allowed
    }

    #[allow(clippy::too_many_arguments)]
    fn process_parsed_token(
        &mut self,
        parsed: ParsedToken,
        position: Option<usize>,
        encryption_token: Option<Arc<SecurityToken>>,
        encrypted_form_id: Option<String>,
        encrypted_form_wsu_id: Option<String>,
        decrypted_buffer: Option<Vec<u8>>,
        eager: bool,
    ) -> Result<()> {
        let (payload, mode) = match parsed {
            ParsedToken::DerivedKeyStub(stub) => {
                if eager {
                    let source = stub
                        .try_resolve_source(self.combined_universal.as_ref())
                        .ok_or_else(|| {
                            Error::Resolution(
                                "the source token of a derived key token could not be resolved"
                                    .into(),
                            )
                        })?;
                    let token = self.materialize_derived_key(&stub, source)?;
                    (
                        ElementPayload::Token(TokenEntry::Resolved(token)),
                        BindingMode::Unknown,
                    )
                } else {
                    if !self.config.expect_derived_key_tokens {
                        return Err(Error::Structure(
                            "a derived key token was present but not expected".into(),
                        ));
                    }
                    (
                        ElementPayload::Token(TokenEntry::Stub(stub)),
                        BindingMode::Unknown,
                    )
                }
            }
            ParsedToken::Token(token) => {
                let mode = self.authenticate_token(&token, encryption_token.as_ref())?;
                (ElementPayload::Token(TokenEntry::Resolved(token)), mode)
            }
        };

        let position = match position {
            Some(position) => {
                if encryption_token.is_some() {
                    self.store.replace_after_decryption(
                        position,
                        payload,
                        encrypted_form_id,
                        encrypted_form_wsu_id,
                        decrypted_buffer.unwrap_or_default(),
                    );
                } else {
                    self.store.replace_payload(position, payload);
                }
                position
            }
            None => self.store.append(payload, BindingMode::Unknown),
        };
        self.store.set_binding_mode(position, mode);
        Ok(())
    }

    /// Validate a resolved token against the configured authenticators and
    /// record it with the tracker it belongs to. Returns the binding mode for
    /// the store.
    fn authenticate_token(
        &mut self,
        token: &Arc<SecurityToken>,
        encryption_token: Option<&Arc<SecurityToken>>,
    ) -> Result<BindingMode> {
        let mut used: Option<(Arc<dyn TokenAuthenticator>, bool)> = None;
        for (authenticator, is_primary) in self.allowed_authenticators() {
            if authenticator.can_validate(token) {
                let policies = authenticator.validate(token, self.budget.remaining()?)?;
                self.token_policies.push((Arc::clone(token), policies));
                used = Some((authenticator, is_primary));
                break;
            }
        }
        let (used, is_primary) = used.ok_or_else(|| {
            Error::FailedAuthentication(
                "no configured authenticator recognizes the token".into(),
            )
        })?;

        if is_primary {
            self.primary_token_found = true;
            self.primary_token_tracker.record_token(Arc::clone(token))?;
            self.universal_resolver
                .add(Arc::clone(token), ReferenceStyle::Internal);
            self.primary_resolver
                .add(Arc::clone(token), ReferenceStyle::Internal);
            return Ok(BindingMode::Primary);
        }

        // find or spawn the tracker for this supporting expectation; the same
        // expectation may be met by several parties
        let spec_index = self
            .config
            .supporting_token_specs
            .iter()
            .position(|spec| {
                sigtuna_tokens::authenticator::same_authenticator(&spec.authenticator, &used)
            })
            .ok_or_else(|| {
                Error::TokenConsistency("token validated by an unconfigured authenticator".into())
            })?;
        let spec = Arc::clone(&self.config.supporting_token_specs[spec_index]);

        if spec.attachment_mode.is_basic() && !self.config.expect_basic_tokens {
            return Err(Error::Structure(
                "a basic supporting token was present but not expected".into(),
            ));
        }
        if !spec.attachment_mode.is_basic()
            && !spec.attachment_mode.is_endorsing()
            && !self.config.expect_signed_tokens
        {
            return Err(Error::Structure(
                "a signed supporting token was present but not expected".into(),
            ));
        }

        let tracker_index = match self.supporting_trackers.iter().position(|t| {
            t.spec
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &spec))
                && t.token.is_none()
        }) {
            Some(index) => index,
            None => {
                self.supporting_trackers
                    .push(TokenTracker::new(Some(Arc::clone(&spec))));
                self.supporting_trackers.len() - 1
            }
        };
        let tracker = &mut self.supporting_trackers[tracker_index];
        tracker.record_token(Arc::clone(token))?;
        if encryption_token.is_some() {
            tracker.is_encrypted = true;
            if spec.attachment_mode.is_basic() {
                self.has_encrypted_basic_token = true;
            }
        }

        self.universal_resolver
            .add(Arc::clone(token), ReferenceStyle::Internal);
        Ok(spec.attachment_mode.binding_mode())
    }

    // ── signatures ──────────────────────────────────────────────────────

    fn classify_and_process_signature(
        &mut self,
        position: usize,
        signature: SignatureElement,
        from_decrypted_source: bool,
    ) -> Result<()> {
        if !self.config.expect_signature {
            return Err(Error::Structure(
                "a signature was present but not expected".into(),
            ));
        }
        if !self.order_tracker.primary_signature_done() {
            self.store.set_binding_mode(position, BindingMode::Primary);
            self.process_primary_signature(signature, from_decrypted_source)
        } else {
            self.store
                .set_binding_mode(position, BindingMode::Endorsing);
            self.process_supporting_signature(signature, from_decrypted_source)
        }
    }

    fn process_primary_signature(
        &mut self,
        signature: SignatureElement,
        from_decrypted_source: bool,
    ) -> Result<()> {
        self.order_tracker
            .on_process_signature(from_decrypted_source)?;
        self.primary_signature_value = Some(signature.signature_value.clone());

        // reject known replays before paying for verification
        if self.config.replay_detection_enabled {
            if let Some(cache) = &self.config.nonce_cache {
                if cache.check_nonce(&signature.signature_value) {
                    return Err(Error::Replay("the message is a replay".into()));
                }
            }
        }

        let token =
            self.codec
                .verify_signature(&signature, true, self.combined_primary.as_ref())?;
        self.signature_tracker.record_token(Arc::clone(&token))?;
        self.primary_token_tracker.record_token(token.root_token())?;
        if token.is_derived() {
            self.primary_token_tracker.is_derived_from = true;
        }
        self.received_signature_values.push(SignatureValueEntry {
            value: signature.signature_value,
            from_decrypted_source,
        });
        debug!("primary signature verified");
        Ok(())
    }

    fn process_supporting_signature(
        &mut self,
        signature: SignatureElement,
        from_decrypted_source: bool,
    ) -> Result<()> {
        if !self.config.expect_endorsing_tokens {
            return Err(Error::Structure(
                "an endorsing signature was present but not expected".into(),
            ));
        }

        // An endorsing signature must cover the primary signature; without
        // message protection it covers the timestamp instead.
        let expected_target = if self.config.require_message_protection {
            self.store
                .primary_signature()
                .and_then(|(_, sig)| sig.id.clone())
                .ok_or_else(|| {
                    Error::Structure(
                        "an endorsing signature requires an identified primary signature".into(),
                    )
                })?
        } else {
            self.store
                .timestamp()
                .and_then(|t| t.id.clone())
                .ok_or_else(|| {
                    Error::Structure(
                        "an endorsing signature requires an identified timestamp".into(),
                    )
                })?
        };
        if !signature.reference_ids.iter().any(|r| *r == expected_target) {
            return Err(Error::SignatureInvalid(
                "the endorsing signature does not cover its required target".into(),
            ));
        }

        let token =
            self.codec
                .verify_signature(&signature, false, self.combined_universal.as_ref())?;
        let root = token.root_token();
        let tracker = self
            .supporting_trackers
            .iter_mut()
            .find(|t| {
                t.token
                    .as_ref()
                    .is_some_and(|held| SecurityToken::same_identity(held, &root))
            })
            .ok_or_else(|| {
                Error::TokenConsistency(
                    "an endorsing signature is keyed by an unknown supporting token".into(),
                )
            })?;
        if tracker.already_read_endorsing_signature {
            return Err(Error::Structure(
                "more than one endorsing signature from the same supporting token".into(),
            ));
        }
        tracker.already_read_endorsing_signature = true;
        tracker.is_endorsing = true;
        if token.is_derived() {
            tracker.is_derived_from = true;
        }
        self.received_signature_values.push(SignatureValueEntry {
            value: signature.signature_value,
            from_decrypted_source,
        });
        Ok(())
    }

    // ── completion ──────────────────────────────────────────────────────

    fn complete(mut self) -> Result<ProcessedSecurityHeader> {
        if !self.pending_reference_entries.is_empty() {
            return Err(Error::MissingElement(format!(
                "{} reference list entries were never matched by encrypted data",
                self.pending_reference_entries.len()
            )));
        }

        self.signature_tracker.set_derivation_source_if_required();
        self.encryption_tracker.set_derivation_source_if_required();

        self.apply_primary_signature_coverage();
        self.check_required_signature_and_confirmation()?;
        self.check_required_targets()?;
        self.check_protection_order()?;
        self.check_encryption_token_consistency()?;
        self.check_primary_token_requirements()?;
        let supporting = self.verify_supporting_tokens()?;
        self.check_replay()?;

        debug!("security header processed");
        Ok(ProcessedSecurityHeader {
            signature_token: self.signature_tracker.token().cloned(),
            encryption_token: self.encryption_tracker.token().cloned(),
            timestamp: self.store.timestamp().cloned(),
            basic_supporting_tokens: supporting.basic,
            signed_supporting_tokens: supporting.signed,
            endorsing_supporting_tokens: supporting.endorsing,
            signed_endorsing_supporting_tokens: supporting.signed_endorsing,
            signature_confirmations: self.received_confirmations,
            received_signature_values: self.received_signature_values,
            primary_signature_value: self.primary_signature_value,
            token_policies: self.token_policies,
        })
    }

    /// Mark everything the primary signature covers, then propagate the
    /// signed flags into the token trackers.
    fn apply_primary_signature_coverage(&mut self) {
        let reference_ids = match self.store.primary_signature() {
            Some((_, sig)) => sig.reference_ids.clone(),
            None => return,
        };
        for id in &reference_ids {
            self.store.mark_signed(id);
        }

        let mut signed_tokens: Vec<Arc<SecurityToken>> = Vec::new();
        for (_, entry) in self.store.iter() {
            if !entry.signed {
                continue;
            }
            if let ElementPayload::Token(TokenEntry::Resolved(token)) = &entry.payload {
                signed_tokens.push(Arc::clone(token));
            }
        }
        for token in signed_tokens {
            let root = token.root_token();
            for tracker in &mut self.supporting_trackers {
                if tracker
                    .token
                    .as_ref()
                    .is_some_and(|held| SecurityToken::same_identity(held, &root))
                {
                    tracker.is_signed = true;
                }
            }
            if self
                .primary_token_tracker
                .token
                .as_ref()
                .is_some_and(|held| SecurityToken::same_identity(held, &root))
            {
                self.primary_token_tracker.is_signed = true;
            }
        }
    }

    fn check_required_signature_and_confirmation(&self) -> Result<()> {
        if self.config.required_signature_parts.is_some()
            && self.signature_tracker.token().is_none()
        {
            return Err(Error::MissingElement(
                "a required signature is missing from the security header".into(),
            ));
        }
        if self.config.expect_signature_confirmation {
            self.store.verify_signature_confirmation_was_found()?;
        }
        Ok(())
    }

    fn check_required_targets(&self) -> Result<()> {
        let signed_kinds = self
            .config
            .required_signature_parts
            .as_ref()
            .map(|p| p.header_kinds.as_slice())
            .unwrap_or(&[]);
        let encrypted_kinds = self
            .config
            .required_encryption_parts
            .as_ref()
            .map(|p| p.header_kinds.as_slice())
            .unwrap_or(&[]);
        self.store
            .ensure_required_targets_protected(signed_kinds, encrypted_kinds)
    }

    fn check_protection_order(&mut self) -> Result<()> {
        // a basic token arriving encrypted proves the sender did encrypt
        // header content, so the relaxed order no longer applies
        if self.order_downgraded && self.has_encrypted_basic_token {
            self.order_tracker.set_enforced_order(Some(
                ProtectionOrder::SignBeforeEncryptAndEncryptSignature,
            ));
        }
        self.order_tracker.enforce_protection_order()
    }

    fn check_encryption_token_consistency(&self) -> Result<()> {
        let encryption_token = match self.encryption_tracker.token() {
            Some(token) => token,
            None => return Ok(()),
        };
        let expected = self
            .wrapped_key_token
            .as_ref()
            .or(self.config.expected_encryption_token.as_ref())
            .or_else(|| self.signature_tracker.token());
        if let Some(expected) = expected {
            if !SecurityToken::same_identity(encryption_token, expected) {
                return Err(Error::TokenConsistency(
                    "the encryption token does not match the token the binding requires".into(),
                ));
            }
        }
        Ok(())
    }

    fn check_primary_token_requirements(&self) -> Result<()> {
        if let Some(parameters) = &self.config.primary_token_parameters {
            if parameters.require_derived_keys
                && !parameters.has_asymmetric_key
                && self.config.enforce_derived_key_requirement
                && self.primary_token_tracker.token.is_some()
                && !self.primary_token_tracker.is_derived_from
            {
                return Err(Error::TokenConsistency(
                    "the primary token was required to be used via derived keys".into(),
                ));
            }
        }
        if self.config.require_signed_primary_token
            && self.primary_token_tracker.token.is_some()
            && !self.primary_token_tracker.is_signed
        {
            return Err(Error::TokenConsistency(
                "the primary token was required to be covered by the primary signature".into(),
            ));
        }
        Ok(())
    }

    fn verify_supporting_tokens(&self) -> Result<SupportingTokens> {
        let mut result = SupportingTokens::default();
        for tracker in &self.supporting_trackers {
            let category = tracker.verify(
                self.config.require_message_protection,
                self.config.enforce_derived_key_requirement,
            )?;
            let token = match (&category, &tracker.token) {
                (Some(_), Some(token)) => Arc::clone(token),
                _ => continue,
            };
            match category {
                Some(SupportingTokenCategory::Basic) => result.basic.push(token),
                Some(SupportingTokenCategory::Signed) => result.signed.push(token),
                Some(SupportingTokenCategory::Endorsing) => result.endorsing.push(token),
                Some(SupportingTokenCategory::SignedEndorsing) => {
                    result.signed_endorsing.push(token)
                }
                None => {}
            }
        }
        Ok(result)
    }

    fn check_replay(&self) -> Result<()> {
        if !self.config.replay_detection_enabled {
            return Ok(());
        }
        let timestamp = self.store.timestamp().ok_or_else(|| {
            Error::Replay("replay detection requires a timestamp in the security header".into())
        })?;
        timestamp
            .validate_freshness(Some(self.config.replay_window), self.config.clock_skew)?;
        let signature_value = self.primary_signature_value.as_ref().ok_or_else(|| {
            Error::Replay("replay detection requires a signed message".into())
        })?;
        let cache = self.config.nonce_cache.as_ref().ok_or_else(|| {
            Error::Structure("replay detection is enabled but no nonce cache is configured".into())
        })?;
        if !cache.try_add_nonce(signature_value) {
            return Err(Error::Replay("the message is a replay".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SupportingTokens {
    basic: Vec<Arc<SecurityToken>>,
    signed: Vec<Arc<SecurityToken>>,
    endorsing: Vec<Arc<SecurityToken>>,
    signed_endorsing: Vec<Arc<SecurityToken>>,
}
