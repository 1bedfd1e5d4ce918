//! Check, note, start and finish, plus their proxied forms

use appops_core::{
    is_always_allowed, CallerContext, ClientToken, Identity, Mode, OpCode, OpFlags, Privileges,
    Result, StartType,
};

use super::{AppOpsEngine, OpRequest, ProxyStartOptions, StartOptions};
use crate::usage::event::StartParams;
use crate::usage::{AccessKey, EventSummary, FinishOutcome, StartOutcome};

impl AppOpsEngine {
    /// Current decision for `request`; nothing is recorded
    ///
    /// `raw` returns a stored `Foreground` mode without evaluating the uid's
    /// foreground state.
    pub fn check_operation(&self, caller: &CallerContext, request: &OpRequest, raw: bool) -> Result<Mode> {
        self.verify_incoming(caller, request.uid)?;
        let Some(info) = self.catalog.get(request.op) else {
            tracing::debug!(op = %request.op, uid = %request.uid, "check of unknown op");
            return Ok(Mode::Errored);
        };
        if info.restrict_read {
            self.require(caller, Privileges::MANAGE_MODES, "check a restricted op")?;
        }
        if is_always_allowed(request.uid) {
            return Ok(Mode::Allowed);
        }

        let Some(subject) = self.resolve_subject(request) else {
            let mode = self
                .config
                .check_invalid_package_mode
                .unwrap_or_else(|| self.switch_default(info));
            tracing::debug!(op = %request.op, uid = %request.uid, package = ?request.package, %mode, "check for unresolvable package");
            return Ok(mode);
        };

        let now = self.clock.now();
        let state = self.state.lock();
        let resolution = state
            .view(&self.catalog, now)
            .resolve(info, &subject.subject(), true, raw);
        Ok(resolution.mode)
    }

    /// Decide `request` and record the one-shot access or rejection
    ///
    /// `proxy` names the party that performed the access on the subject's
    /// behalf; it is recorded with proxied flags.
    pub fn note_operation(
        &self,
        caller: &CallerContext,
        request: &OpRequest,
        proxy: Option<&Identity>,
    ) -> Result<Mode> {
        self.verify_incoming(caller, request.uid)?;
        let flags = match proxy {
            Some(_) => OpFlags::proxied(caller.has(Privileges::UPDATE_STATS)),
            None => OpFlags::SELF,
        };
        Ok(self.note_with_flags(request, proxy.cloned(), flags))
    }

    /// Note an access performed by `proxy` on behalf of `proxied`
    ///
    /// The proxy is noted first unless `skip_proxy`; when it is not allowed
    /// its decision is returned and the proxied side is left alone.
    pub fn note_proxy_operation(
        &self,
        caller: &CallerContext,
        op: OpCode,
        proxy: &Identity,
        proxied: &Identity,
        skip_proxy: bool,
    ) -> Result<Mode> {
        self.verify_incoming(caller, proxy.uid)?;
        let trusted = caller.has(Privileges::UPDATE_STATS);
        if !skip_proxy {
            let proxy_mode =
                self.note_with_flags(&OpRequest::from_identity(op, proxy), None, OpFlags::proxy(trusted));
            if proxy_mode != Mode::Allowed {
                return Ok(proxy_mode);
            }
        }
        Ok(self.note_with_flags(
            &OpRequest::from_identity(op, proxied),
            Some(proxy.clone()),
            OpFlags::proxied(trusted),
        ))
    }

    fn note_with_flags(&self, request: &OpRequest, proxy: Option<Identity>, flags: OpFlags) -> Mode {
        let Some(info) = self.catalog.get(request.op) else {
            tracing::debug!(op = %request.op, uid = %request.uid, "note of unknown op");
            return Mode::Errored;
        };
        let Some(subject) = self.resolve_subject(request) else {
            if is_always_allowed(request.uid) {
                return Mode::Allowed;
            }
            tracing::debug!(op = %request.op, uid = %request.uid, package = ?request.package, "note for unresolvable package");
            return Mode::Ignored;
        };

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let resolution = state
            .view(&self.catalog, now)
            .resolve(info, &subject.subject(), false, false);
        let key = AccessKey {
            uid_state: state.uid_states.effective(subject.uid, now.elapsed_ms).state,
            flags,
        };

        if let Some(attribution) = state.attribution_for(&subject, request.op) {
            if let Some(record) = state.registry.attribution_mut(attribution) {
                if resolution.mode == Mode::Allowed {
                    record.accessed(proxy, key, now);
                } else {
                    record.rejected(proxy, key, now);
                }
            }
        }
        if resolution.mode != Mode::Allowed {
            tracing::debug!(
                op = %request.op,
                uid = %subject.uid,
                package = %subject.package,
                mode = %resolution.mode,
                restricted = resolution.restricted,
                "note rejected"
            );
        }

        self.notify_noted(state, &subject, request.op, flags, resolution.mode);
        state.writes.schedule(now.elapsed_ms);
        resolution.mode
    }

    /// Begin a long-running usage identified by `token`
    ///
    /// Repeated starts with the same token nest. A start the mode allows
    /// while a restriction applies is parked as paused and returns
    /// `Ignored`; it resumes when the restriction lifts.
    pub fn start_operation(
        &self,
        caller: &CallerContext,
        token: ClientToken,
        request: &OpRequest,
        options: &StartOptions,
    ) -> Result<Mode> {
        self.verify_incoming(caller, request.uid)?;
        let flags = match options.proxy {
            Some(_) => OpFlags::proxied(caller.has(Privileges::UPDATE_STATS)),
            None => OpFlags::SELF,
        };
        Ok(self.start_with_flags(token, request, options, flags))
    }

    /// Start `op` for `proxied` through `proxy`, linking both into one chain
    ///
    /// The proxy is checked without recording first; the proxied side is
    /// started, then the proxy. When the proxy's own start is refused the
    /// proxied start is rolled back.
    pub fn start_proxy_operation(
        &self,
        caller: &CallerContext,
        token: ClientToken,
        op: OpCode,
        proxy: &Identity,
        proxied: &Identity,
        options: &ProxyStartOptions,
    ) -> Result<Mode> {
        self.verify_incoming(caller, proxy.uid)?;
        let trusted = caller.has(Privileges::UPDATE_STATS);
        let proxy_request = OpRequest::from_identity(op, proxy);
        let proxied_request = OpRequest::from_identity(op, proxied);

        if !options.skip_proxy {
            let dry_run = self.dry_run_start(&proxy_request, options.start_if_mode_default);
            if dry_run != Mode::Allowed {
                tracing::debug!(op = %op, proxy = %proxy.uid, mode = %dry_run, "proxy may not start");
                return Ok(dry_run);
            }
        }

        let chain_id = options.chain_id.unwrap_or_else(|| self.allocate_chain_id());
        let proxied_options = StartOptions {
            proxy: Some(proxy.clone()),
            attribution_flags: options.proxied_attribution_flags,
            chain_id: Some(chain_id),
            start_if_mode_default: options.start_if_mode_default,
        };
        let proxied_mode =
            self.start_with_flags(token, &proxied_request, &proxied_options, OpFlags::proxied(trusted));
        if proxied_mode != Mode::Allowed || options.skip_proxy {
            return Ok(proxied_mode);
        }

        let proxy_options = StartOptions {
            proxy: None,
            attribution_flags: options.proxy_attribution_flags,
            chain_id: Some(chain_id),
            start_if_mode_default: options.start_if_mode_default,
        };
        let proxy_mode = self.start_with_flags(token, &proxy_request, &proxy_options, OpFlags::proxy(trusted));
        if proxy_mode != Mode::Allowed {
            self.finish_quietly(token, &proxied_request);
        }
        Ok(proxy_mode)
    }

    /// Decision a start would get, without recording anything
    fn dry_run_start(&self, request: &OpRequest, start_if_mode_default: bool) -> Mode {
        let Some(info) = self.catalog.get(request.op) else {
            return Mode::Errored;
        };
        let Some(subject) = self.resolve_subject(request) else {
            return if is_always_allowed(request.uid) {
                Mode::Allowed
            } else {
                Mode::Ignored
            };
        };
        let now = self.clock.now();
        let state = self.state.lock();
        let resolution = state
            .view(&self.catalog, now)
            .resolve(info, &subject.subject(), false, false);
        if resolution.restricted {
            return Mode::Ignored;
        }
        match resolution.policy_mode {
            Mode::Default if start_if_mode_default => Mode::Allowed,
            mode => mode,
        }
    }

    fn start_with_flags(
        &self,
        token: ClientToken,
        request: &OpRequest,
        options: &StartOptions,
        flags: OpFlags,
    ) -> Mode {
        let Some(info) = self.catalog.get(request.op) else {
            tracing::debug!(op = %request.op, uid = %request.uid, "start of unknown op");
            return Mode::Errored;
        };
        let Some(subject) = self.resolve_subject(request) else {
            if is_always_allowed(request.uid) {
                return Mode::Allowed;
            }
            tracing::debug!(op = %request.op, uid = %request.uid, package = ?request.package, "start for unresolvable package");
            return Mode::Ignored;
        };

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let resolution = state
            .view(&self.catalog, now)
            .resolve(info, &subject.subject(), false, false);
        let policy_allows = match resolution.policy_mode {
            Mode::Allowed => true,
            Mode::Default => options.start_if_mode_default,
            _ => false,
        };
        let uid_state = state.uid_states.effective(subject.uid, now.elapsed_ms).state;

        let Some(key) = state.attribution_for(&subject, request.op) else {
            return Mode::Ignored;
        };
        let Some(record) = state.registry.attribution_mut(key) else {
            return Mode::Ignored;
        };
        let id = record.id.clone();
        let summary = EventSummary {
            token,
            flags,
            attribution_flags: options.attribution_flags,
            chain_id: options.chain_id,
        };

        if !policy_allows {
            record.rejected(options.proxy.clone(), AccessKey { uid_state, flags }, now);
            tracing::debug!(op = %id.op, uid = %id.uid, package = %id.package, mode = %resolution.mode, "start rejected");
            self.notify_started(state, &id, &summary, resolution.mode, StartType::Failed);
            state.writes.schedule(now.elapsed_ms);
            return resolution.mode;
        }

        let params = StartParams {
            token,
            proxy: options.proxy.clone(),
            uid_state,
            flags,
            attribution_flags: options.attribution_flags,
            chain_id: options.chain_id,
        };

        if resolution.restricted {
            record.create_paused(&mut state.pool, params, now);
            tracing::debug!(op = %id.op, uid = %id.uid, package = %id.package, token = %token, "start parked while restricted");
            self.notify_started(state, &id, &summary, Mode::Ignored, StartType::Failed);
            return Mode::Ignored;
        }

        let outcome = record.started(&mut state.pool, params, now);
        self.notify_started(state, &id, &summary, Mode::Allowed, StartType::Started);
        if outcome == StartOutcome::Started {
            self.notify_active(state, &id, &summary, true);
        }
        state.writes.schedule(now.elapsed_ms);
        Mode::Allowed
    }

    /// Undo one start of `token`
    ///
    /// Unknown tokens, including ones already finished, are ignored.
    pub fn finish_operation(&self, caller: &CallerContext, token: ClientToken, request: &OpRequest) -> Result<()> {
        self.verify_incoming(caller, request.uid)?;
        self.finish_quietly(token, request);
        Ok(())
    }

    /// Finish both sides of a proxied start
    pub fn finish_proxy_operation(
        &self,
        caller: &CallerContext,
        token: ClientToken,
        op: OpCode,
        proxy: &Identity,
        proxied: &Identity,
        skip_proxy: bool,
    ) -> Result<()> {
        self.verify_incoming(caller, proxy.uid)?;
        self.finish_quietly(token, &OpRequest::from_identity(op, proxied));
        if !skip_proxy {
            self.finish_quietly(token, &OpRequest::from_identity(op, proxy));
        }
        Ok(())
    }

    fn finish_quietly(&self, token: ClientToken, request: &OpRequest) {
        if !self.catalog.contains(request.op) {
            tracing::debug!(op = %request.op, token = %token, "finish of unknown op");
            return;
        }
        let Some(subject) = self.resolve_subject(request) else {
            tracing::debug!(op = %request.op, uid = %request.uid, token = %token, "finish for unresolvable package");
            return;
        };

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(key) = state.registry.find_attribution(
            subject.uid,
            subject.package.as_str(),
            request.op,
            &subject.device,
            subject.tag.as_ref(),
        ) else {
            tracing::debug!(op = %request.op, uid = %subject.uid, token = %token, "finish without a start");
            return;
        };
        let Some(record) = state.registry.attribution_mut(key) else {
            return;
        };
        let summary = record.event(token).map(EventSummary::from);
        let id = record.id.clone();

        match record.finished(&mut state.pool, token, now) {
            FinishOutcome::Unknown => {
                tracing::debug!(op = %id.op, uid = %id.uid, token = %token, "finish of unknown token");
            }
            FinishOutcome::Nested => {}
            FinishOutcome::Finished { was_running } => {
                if let (true, Some(summary)) = (was_running, summary) {
                    self.notify_active(state, &id, &summary, false);
                }
                state.registry.prune(key);
                state.writes.schedule(now.elapsed_ms);
            }
        }
    }
}
