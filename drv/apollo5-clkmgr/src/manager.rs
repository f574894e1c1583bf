// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::cell::RefCell;
use core::marker::PhantomData;

use critical_section::{CriticalSection, Mutex, RestoreState};
use enum_map::EnumMap;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::clkgen::{self, ClockConfig, HfrcAdj};
use crate::{
    BoardInfo, ClkError, ClockHw, ClockId, OscMode, OscStatus, UserBitmap,
    UserId, HFRC2_ADJ_196P608_HZ, HFRC2_ADJ_250_HZ, HFRC2_FREE_RUN_HZ,
    HFRC_ADJ_48_HZ, HFRC_FREE_RUN_HZ,
};

const HFRC_SETTLE_US: u32 = 10_000;
const HFRC2_SETTLE_US: u32 = 500;
const XTAL_HS_STARTUP_US: u32 = 1_500;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    Configured { clock: ClockId, freq_hz: u32 },
    Switched { clock: ClockId, freq_hz: u32 },
    Enabled(ClockId),
    Disabled(ClockId),
    AdjApplied(ClockId),
    AdjDisabled(ClockId),
    AdjFailed(ClockId),
    DependencyFailed {
        clock: ClockId,
        dependency: ClockId,
        error: ClkError,
    },
    Rollback(ClockId),
    /// Putting the previous adjust setting back failed too; the source is
    /// left running on whatever the hardware now has.
    RollbackFailed {
        clock: ClockId,
        error: ClkError,
    },
    /// The adjust block would not turn off while stopping the source.
    StopFailed {
        clock: ClockId,
        error: ClkError,
    },
    LockFailed,
}

/// Holds a critical section open until dropped.
pub struct CriticalGuard {
    restore: RestoreState,
    // Must be released on the context that acquired it.
    _not_send: PhantomData<*mut ()>,
}

impl CriticalGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        // Safety: released exactly once, in Drop, and guards nest
        // lexically since they cannot be moved to another context.
        let restore = unsafe { critical_section::acquire() };
        Self {
            restore,
            _not_send: PhantomData,
        }
    }

    pub fn token(&self) -> CriticalSection<'_> {
        // Safety: the section is held for as long as `self` is borrowed.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        // Safety: paired with the acquire in `new`.
        unsafe { critical_section::release(self.restore) }
    }
}

/// The cached frequency of a variable source and the adjust or PLL setting
/// that produces it. `config` is `None` for a free-running oscillator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockSetting {
    pub freq_hz: u32,
    pub config: Option<ClockConfig>,
}

/// Presets that can be switched between while a source has users.
struct SwitchablePair {
    clock: ClockId,
    presets: [u32; 2],
}

static SWITCHABLE: [SwitchablePair; 2] = [
    SwitchablePair {
        clock: ClockId::Hfrc,
        presets: [HFRC_FREE_RUN_HZ, HFRC_ADJ_48_HZ],
    },
    SwitchablePair {
        clock: ClockId::Hfrc2,
        presets: [HFRC2_FREE_RUN_HZ, HFRC2_ADJ_250_HZ],
    },
];

fn switchable(clock: ClockId, from_hz: u32, to_hz: u32) -> bool {
    SWITCHABLE.iter().any(|p| {
        p.clock == clock
            && p.presets.contains(&from_hz)
            && p.presets.contains(&to_hz)
    })
}

fn presets(clock: ClockId) -> &'static [u32] {
    match clock {
        ClockId::Hfrc => &[HFRC_FREE_RUN_HZ, HFRC_ADJ_48_HZ],
        ClockId::Hfrc2 => &[
            HFRC2_FREE_RUN_HZ,
            HFRC2_ADJ_196P608_HZ,
            HFRC2_ADJ_250_HZ,
        ],
        _ => &[],
    }
}

fn free_running(clock: ClockId) -> Option<ClockSetting> {
    let freq_hz = match clock {
        ClockId::Hfrc => HFRC_FREE_RUN_HZ,
        ClockId::Hfrc2 => HFRC2_FREE_RUN_HZ,
        _ => return None,
    };
    Some(ClockSetting {
        freq_hz,
        config: None,
    })
}

fn dependency_user(clock: ClockId) -> UserId {
    match clock {
        ClockId::Hfrc => UserId::HFRC_DEPENDENCY,
        ClockId::Hfrc2 => UserId::HFRC2_DEPENDENCY,
        _ => UserId::SYSPLL_DEPENDENCY,
    }
}

/// Works out the setting for `clock` at `freq_hz` on `board`.
fn derive_config(
    board: &BoardInfo,
    clock: ClockId,
    freq_hz: u32,
    explicit: Option<ClockConfig>,
) -> Result<Option<ClockConfig>, ClkError> {
    if explicit.is_some_and(|c| c.clock() != clock) {
        return Err(ClkError::InvalidArgument);
    }
    let config = match clock {
        ClockId::Hfrc | ClockId::Hfrc2 => {
            if !presets(clock).contains(&freq_hz) {
                return Err(ClkError::OutOfRange);
            }
            if free_running(clock).is_some_and(|s| s.freq_hz == freq_hz) {
                return Ok(None);
            }
            match (explicit, clock) {
                (Some(c), _) => c,
                (None, ClockId::Hfrc) => ClockConfig::Hfrc(clkgen::hfrc_adj(
                    board.xtal_ls.freq_hz,
                    freq_hz,
                )?),
                (None, _) => {
                    let (sel, ref_hz) =
                        board.hf_reference().ok_or(ClkError::InvalidOperation)?;
                    ClockConfig::Hfrc2(clkgen::hfrc2_adj(sel, ref_hz, freq_hz)?)
                }
            }
        }
        ClockId::Syspll => match explicit {
            Some(c) => c,
            None => {
                let (sel, ref_hz) =
                    board.hf_reference().ok_or(ClkError::InvalidOperation)?;
                ClockConfig::Syspll(clkgen::syspll_config(sel, ref_hz, freq_hz)?)
            }
        },
        _ => return Err(ClkError::InvalidOperation),
    };
    if board.ref_hz(config.reference()) == 0 {
        return Err(ClkError::InvalidOperation);
    }
    Ok(Some(config))
}

struct State {
    board: BoardInfo,
    users: EnumMap<ClockId, UserBitmap>,
    settings: EnumMap<ClockId, Option<ClockSetting>>,
    /// Whether a variable source has been started. Tracked apart from the
    /// user count so two racing first requests start it once.
    running: EnumMap<ClockId, bool>,
    trace: Ringbuf<Trace, 32>,
}

/// Reference-counts clock sources on behalf of any number of users.
///
/// Every operation takes `&self` and serializes its bookkeeping through
/// short critical sections, so a manager can live in a `static` and be
/// called from interrupt handlers. Oscillator and PLL settle waits happen
/// outside the critical sections.
pub struct ClockManager<H> {
    hw: H,
    state: Mutex<RefCell<State>>,
}

impl<H: ClockHw> ClockManager<H> {
    pub fn new(hw: H, board: BoardInfo) -> Self {
        let mut settings = EnumMap::default();
        settings[ClockId::Hfrc] = free_running(ClockId::Hfrc);
        settings[ClockId::Hfrc2] = free_running(ClockId::Hfrc2);
        Self {
            hw,
            state: Mutex::new(RefCell::new(State {
                board,
                users: EnumMap::default(),
                settings,
                running: EnumMap::default(),
                trace: Ringbuf::new(Trace::None),
            })),
        }
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn with_trace<R>(&self, f: impl FnOnce(&Ringbuf<Trace, 32>) -> R) -> R {
        self.with_state(|s| f(&s.trace))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let guard = CriticalGuard::new();
        let mut state = self.state.borrow_ref_mut(guard.token());
        f(&mut state)
    }

    pub fn board_info_get(&self) -> BoardInfo {
        self.with_state(|s| s.board)
    }

    /// Replaces the board description. Refused while any reference clock is
    /// running, since its users were set up against the old one.
    pub fn board_info_set(&self, board: BoardInfo) -> Result<(), ClkError> {
        self.with_state(|s| {
            let in_use = [ClockId::XtalLs, ClockId::XtalHs, ClockId::ExtRefClk]
                .iter()
                .any(|&c| s.users[c].any());
            if in_use {
                return Err(ClkError::InUse);
            }
            s.board = board;
            Ok(())
        })
    }

    /// Number of users currently holding `clock`, including holds the
    /// manager makes for dependent sources.
    pub fn status(&self, clock: ClockId) -> u32 {
        self.with_state(|s| s.users[clock].count())
    }

    pub fn config_get(&self, clock: ClockId) -> Result<ClockSetting, ClkError> {
        if !clock.is_variable() {
            return Err(ClkError::InvalidOperation);
        }
        Ok(self.with_state(|s| {
            s.settings[clock].unwrap_or(ClockSetting {
                freq_hz: 0,
                config: None,
            })
        }))
    }

    /// Sets the frequency `clock` will run at.
    ///
    /// Without an explicit `config` one is derived from the board's
    /// reference clocks. While the source has users only a switch within
    /// one of its switchable preset pairs is allowed, and is applied to the
    /// running hardware at once; anything else takes effect on the next
    /// first request.
    pub fn configure(
        &self,
        clock: ClockId,
        freq_hz: u32,
        config: Option<ClockConfig>,
    ) -> Result<(), ClkError> {
        let board = self.board_info_get();
        let new = ClockSetting {
            freq_hz,
            config: derive_config(&board, clock, freq_hz, config)?,
        };

        let (old, active) = self.with_state(|s| {
            let old = s.settings[clock];
            let active = s.users[clock].any();
            if active {
                let from_hz = old.map_or(0, |o| o.freq_hz);
                if !switchable(clock, from_hz, freq_hz) {
                    return Err(ClkError::InUse);
                }
            }
            s.settings[clock] = Some(new);
            ringbuf_entry!(s.trace, Trace::Configured { clock, freq_hz });
            Ok((old, active))
        })?;

        if active {
            self.switch_live(clock, old, new)?;
        }
        Ok(())
    }

    fn switch_live(
        &self,
        clock: ClockId,
        old: Option<ClockSetting>,
        new: ClockSetting,
    ) -> Result<(), ClkError> {
        let dep_user = dependency_user(clock);
        let old_ref = old.and_then(|o| o.config).map(|c| c.reference());
        let new_ref = new.config.map(|c| c.reference());

        if let Some(dependency) = new_ref {
            if let Err(error) = self.request(dependency, dep_user) {
                self.with_state(|s| {
                    s.settings[clock] = old;
                    ringbuf_entry!(
                        s.trace,
                        Trace::DependencyFailed {
                            clock,
                            dependency,
                            error
                        }
                    );
                });
                return Err(error);
            }
        }

        let result = self.with_state(|s| {
            if !s.running[clock] {
                // Nothing to retune yet; a request in flight starts the
                // source on the new setting.
                return Ok((s.users[clock].any(), false));
            }
            match self.apply_adj(s, clock, new.config) {
                Ok(()) => {
                    ringbuf_entry!(
                        s.trace,
                        Trace::Switched {
                            clock,
                            freq_hz: new.freq_hz
                        }
                    );
                    Ok((true, true))
                }
                Err(e) => {
                    if let Err(error) =
                        self.apply_adj(s, clock, old.and_then(|o| o.config))
                    {
                        ringbuf_entry!(
                            s.trace,
                            Trace::RollbackFailed { clock, error }
                        );
                    }
                    s.settings[clock] = old;
                    ringbuf_entry!(s.trace, Trace::Rollback(clock));
                    Err(e)
                }
            }
        });

        let keep = match result {
            Ok((true, _)) => new_ref,
            Ok((false, _)) => None,
            Err(_) => old_ref,
        };
        for r in [old_ref, new_ref].into_iter().flatten() {
            if Some(r) != keep {
                self.release(r, dep_user);
            }
        }

        let (_, applied) = result?;
        if applied && new.config.is_some() {
            self.settle(clock);
        }
        Ok(())
    }

    /// Adds `user` to the holders of `clock`, starting it if needed.
    /// Requesting a clock already held is a no-op.
    pub fn request(&self, clock: ClockId, user: UserId) -> Result<(), ClkError> {
        match clock {
            ClockId::Lfrc => {
                self.with_state(|s| {
                    if s.users[clock].set(user) && s.users[clock].count() == 1 {
                        ringbuf_entry!(s.trace, Trace::Enabled(clock));
                    }
                });
                Ok(())
            }
            ClockId::XtalLs | ClockId::XtalHs | ClockId::ExtRefClk => {
                self.request_reference(clock, user)
            }
            ClockId::Hfrc | ClockId::Hfrc2 => self.request_adjustable(clock, user),
            ClockId::Syspll => self.request_syspll(user),
        }
    }

    fn request_reference(&self, clock: ClockId, user: UserId) -> Result<(), ClkError> {
        let kick_started = self.with_state(|s| {
            if s.users[clock].test(user) {
                return Ok(false);
            }
            if s.board.ref_hz(clock) == 0 {
                return Err(ClkError::InvalidOperation);
            }
            let mut kick_started = false;
            let enabled = match clock {
                ClockId::XtalLs => start_crystal(
                    self.hw.xtal_ls_status(),
                    s.board.xtal_ls.mode,
                    |m| self.hw.xtal_ls_enable(m),
                )?,
                ClockId::XtalHs => {
                    let mode = s.board.xtal_hs.mode;
                    let started = start_crystal(self.hw.xtal_hs_status(), mode, |m| {
                        self.hw.xtal_hs_enable(m)
                    })?;
                    kick_started = started && mode == OscMode::Xtal;
                    started
                }
                _ => {
                    let first = !s.users[clock].any();
                    if first {
                        self.hw.extref_enable();
                    }
                    first
                }
            };
            if enabled {
                ringbuf_entry!(s.trace, Trace::Enabled(clock));
            }
            s.users[clock].set(user);
            Ok(kick_started)
        })?;

        if kick_started {
            self.hw.delay_us(XTAL_HS_STARTUP_US);
        }
        Ok(())
    }

    fn request_adjustable(&self, clock: ClockId, user: UserId) -> Result<(), ClkError> {
        let dep_user = dependency_user(clock);
        // The user bit goes in first so the setting cannot be swapped out
        // from under this request.
        let Some((reference, held)) = self.with_state(|s| {
            if !s.users[clock].set(user) {
                return None;
            }
            let reference = s.settings[clock]
                .and_then(|c| c.config)
                .map(|c| c.reference());
            let held = reference.is_some_and(|r| s.users[r].test(dep_user));
            Some((reference, held))
        }) else {
            return Ok(());
        };

        if let Some(dependency) = reference {
            if let Err(error) = self.request(dependency, dep_user) {
                self.with_state(|s| {
                    s.users[clock].clear(user);
                    ringbuf_entry!(
                        s.trace,
                        Trace::DependencyFailed {
                            clock,
                            dependency,
                            error
                        }
                    );
                });
                return Err(error);
            }
        }

        let started = self.with_state(|s| {
            if s.running[clock] {
                return Ok(false);
            }
            let config = s.settings[clock].and_then(|c| c.config);
            self.force_on(clock, true);
            if config.is_some() {
                if let Err(e) = self.apply_adj(s, clock, config) {
                    self.force_on(clock, false);
                    s.users[clock].clear(user);
                    ringbuf_entry!(s.trace, Trace::Rollback(clock));
                    return Err(e);
                }
            }
            s.running[clock] = true;
            ringbuf_entry!(s.trace, Trace::Enabled(clock));
            Ok(config.is_some())
        });

        match started {
            Ok(adjusted) => {
                if adjusted {
                    self.settle(clock);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(r) = reference.filter(|_| !held) {
                    self.release(r, dep_user);
                }
                Err(e)
            }
        }
    }

    fn request_syspll(&self, user: UserId) -> Result<(), ClkError> {
        let clock = ClockId::Syspll;
        let dep_user = dependency_user(clock);
        let Some((cfg, sel_held, other_held)) = self.with_state(|s| {
            let Some(ClockConfig::Syspll(cfg)) =
                s.settings[clock].and_then(|c| c.config)
            else {
                return Err(ClkError::NotConfigured);
            };
            // Already running means the references are already held on
            // its behalf.
            if !s.users[clock].set(user) || s.running[clock] {
                return Ok(None);
            }
            Ok(Some((
                cfg,
                s.users[cfg.ref_sel.clock()].test(dep_user),
                s.users[cfg.ref_sel.other().clock()].test(dep_user),
            )))
        })?
        else {
            return Ok(());
        };
        let selected = cfg.ref_sel.clock();
        let other = cfg.ref_sel.other().clock();

        // The reference mux wants both inputs running while it switches.
        // Only the selected one has to be fitted.
        let sel_result = self.request(selected, dep_user);
        let other_acquired = !other_held && self.request(other, dep_user).is_ok();
        let sel_acquired = !sel_held && sel_result.is_ok();

        let unwind = |both: bool| {
            if other_acquired {
                self.release(other, dep_user);
            }
            if both && sel_acquired {
                self.release(selected, dep_user);
            }
        };

        if let Err(error) = sel_result {
            self.with_state(|s| {
                s.users[clock].clear(user);
                ringbuf_entry!(
                    s.trace,
                    Trace::DependencyFailed {
                        clock,
                        dependency: selected,
                        error
                    }
                );
            });
            unwind(true);
            return Err(error);
        }

        let started = self.with_state(|s| {
            if s.running[clock] {
                return Ok(false);
            }
            let r = self
                .hw
                .syspll_configure(&cfg)
                .and_then(|()| self.hw.syspll_enable());
            if let Err(e) = r {
                self.hw.syspll_disable();
                s.users[clock].clear(user);
                ringbuf_entry!(s.trace, Trace::Rollback(clock));
                return Err(ClkError::from(e));
            }
            s.running[clock] = true;
            ringbuf_entry!(s.trace, Trace::Enabled(clock));
            Ok(true)
        });

        match started {
            Err(e) => {
                unwind(true);
                Err(e)
            }
            Ok(false) => {
                unwind(false);
                Ok(())
            }
            Ok(true) => {
                if let Err(e) = self.hw.syspll_lock_wait() {
                    let stopped = self.with_state(|s| {
                        ringbuf_entry!(s.trace, Trace::LockFailed);
                        s.users[clock].clear(user);
                        let stopped = !s.users[clock].any();
                        if stopped {
                            self.stop(s, clock);
                        }
                        stopped
                    });
                    unwind(false);
                    if stopped {
                        self.release_dependencies(clock);
                    }
                    return Err(e.into());
                }
                unwind(false);
                Ok(())
            }
        }
    }

    /// Removes `user` from the holders of `clock`, stopping it if that was
    /// the last one. Releasing a clock not held is a no-op.
    pub fn release(&self, clock: ClockId, user: UserId) {
        let stopped = self.with_state(|s| {
            if !s.users[clock].clear(user) || s.users[clock].any() {
                return false;
            }
            self.stop(s, clock);
            true
        });
        if stopped && clock.is_variable() {
            self.release_dependencies(clock);
        }
    }

    /// Releases everything `user` holds.
    pub fn release_all(&self, user: UserId) {
        let held: EnumMap<ClockId, bool> =
            self.with_state(|s| EnumMap::from_fn(|c| s.users[c].test(user)));
        for (clock, held) in held {
            if held {
                self.release(clock, user);
            }
        }
    }

    /// Legacy HFRC adjust entry point. `target` is a multiple of the
    /// XTAL_LS frequency; `None` selects the adjusted 48 MHz preset.
    pub fn hfadj_apply(&self, target: Option<u32>) -> Result<(), ClkError> {
        let xtal_ls_hz = self.board_info_get().xtal_ls.freq_hz;
        if xtal_ls_hz == 0 {
            return Err(ClkError::InvalidOperation);
        }
        let Some(target) = target else {
            return self.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None);
        };
        let mut freq_hz = target.saturating_mul(xtal_ls_hz);
        if freq_hz.abs_diff(HFRC_ADJ_48_HZ) < xtal_ls_hz {
            freq_hz = HFRC_ADJ_48_HZ;
        }
        self.configure(
            ClockId::Hfrc,
            freq_hz,
            Some(ClockConfig::Hfrc(HfrcAdj { target })),
        )
    }

    pub fn hfadj_disable(&self) -> Result<(), ClkError> {
        self.configure(ClockId::Hfrc, HFRC_FREE_RUN_HZ, None)
    }

    pub fn hf2adj_apply(&self) -> Result<(), ClkError> {
        self.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None)
    }

    pub fn hf2adj_disable(&self) -> Result<(), ClkError> {
        self.configure(ClockId::Hfrc2, HFRC2_FREE_RUN_HZ, None)
    }

    /// Turns `clock` off. Called with the last user gone.
    fn stop(&self, s: &mut State, clock: ClockId) {
        match clock {
            ClockId::Lfrc => (),
            ClockId::XtalLs => self.hw.xtal_ls_disable(),
            ClockId::XtalHs => self.hw.xtal_hs_disable(),
            ClockId::ExtRefClk => self.hw.extref_disable(),
            ClockId::Hfrc | ClockId::Hfrc2 => {
                if s.settings[clock].is_some_and(|c| c.config.is_some()) {
                    // The oscillator goes off regardless.
                    if let Err(error) = self.apply_adj(s, clock, None) {
                        ringbuf_entry!(
                            s.trace,
                            Trace::StopFailed { clock, error }
                        );
                    }
                }
                self.force_on(clock, false);
            }
            ClockId::Syspll => self.hw.syspll_disable(),
        }
        s.running[clock] = false;
        ringbuf_entry!(s.trace, Trace::Disabled(clock));
    }

    fn release_dependencies(&self, clock: ClockId) {
        let dep_user = dependency_user(clock);
        for r in [ClockId::XtalLs, ClockId::XtalHs, ClockId::ExtRefClk] {
            self.release(r, dep_user);
        }
    }

    fn force_on(&self, clock: ClockId, on: bool) {
        match clock {
            ClockId::Hfrc => self.hw.hfrc_force_on(on),
            ClockId::Hfrc2 => self.hw.hfrc2_force_on(on),
            _ => (),
        }
    }

    /// Programs (or with `None`, turns off) the adjust block of `clock`.
    fn apply_adj(
        &self,
        s: &mut State,
        clock: ClockId,
        config: Option<ClockConfig>,
    ) -> Result<(), ClkError> {
        let r = match (clock, config) {
            (ClockId::Hfrc, Some(ClockConfig::Hfrc(adj))) => self.hw.hfadj_apply(&adj),
            (ClockId::Hfrc, None) => self.hw.hfadj_disable(),
            (ClockId::Hfrc2, Some(ClockConfig::Hfrc2(adj))) => self.hw.hf2adj_apply(&adj),
            (ClockId::Hfrc2, None) => self.hw.hf2adj_disable(),
            _ => return Err(ClkError::InvalidOperation),
        };
        match r {
            Ok(()) if config.is_some() => {
                ringbuf_entry!(s.trace, Trace::AdjApplied(clock));
                Ok(())
            }
            Ok(()) => {
                ringbuf_entry!(s.trace, Trace::AdjDisabled(clock));
                Ok(())
            }
            Err(e) => {
                ringbuf_entry!(s.trace, Trace::AdjFailed(clock));
                Err(e.into())
            }
        }
    }

    fn settle(&self, clock: ClockId) {
        match clock {
            ClockId::Hfrc => self.hw.delay_us(HFRC_SETTLE_US),
            ClockId::Hfrc2 => self.hw.delay_us(HFRC2_SETTLE_US),
            _ => (),
        }
    }
}

/// Starts a crystal input in `mode` if it is off. Returns whether it was
/// started; a crystal already running in another mode is `InUse`.
fn start_crystal(
    status: OscStatus,
    mode: OscMode,
    enable: impl FnOnce(OscMode),
) -> Result<bool, ClkError> {
    match status {
        OscStatus::Off => {
            enable(mode);
            Ok(true)
        }
        OscStatus::On(m) if m == mode => Ok(false),
        OscStatus::On(_) => Err(ClkError::InUse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clkgen::{Hfrc2Adj, RefSel, SyspllConfig};
    use crate::{HwFault, RefClock};
    use core::cell::Cell;
    use proptest::prelude::*;

    #[derive(Default)]
    struct MockHw {
        xtal_ls: Cell<Option<OscMode>>,
        xtal_hs: Cell<Option<OscMode>>,
        xtal_hs_enables: Cell<u32>,
        extref: Cell<bool>,
        extref_enables: Cell<u32>,
        hfrc_on: Cell<bool>,
        hfadj: Cell<Option<HfrcAdj>>,
        hfrc2_on: Cell<bool>,
        hf2adj: Cell<Option<Hfrc2Adj>>,
        pll: Cell<Option<SyspllConfig>>,
        pll_on: Cell<bool>,
        fail_hfadj: Cell<bool>,
        fail_hf2adj: Cell<bool>,
        fail_hfadj_disable: Cell<bool>,
        fail_pll_enable: Cell<bool>,
        fail_lock: Cell<bool>,
        waits: RefCell<Vec<u32>>,
    }

    fn fault(fail: &Cell<bool>) -> Result<(), HwFault> {
        if fail.get() {
            Err(HwFault)
        } else {
            Ok(())
        }
    }

    fn status(cell: &Cell<Option<OscMode>>) -> OscStatus {
        cell.get().map_or(OscStatus::Off, OscStatus::On)
    }

    impl ClockHw for MockHw {
        fn xtal_ls_status(&self) -> OscStatus {
            status(&self.xtal_ls)
        }
        fn xtal_ls_enable(&self, mode: OscMode) {
            self.xtal_ls.set(Some(mode));
        }
        fn xtal_ls_disable(&self) {
            self.xtal_ls.set(None);
        }
        fn xtal_hs_status(&self) -> OscStatus {
            status(&self.xtal_hs)
        }
        fn xtal_hs_enable(&self, mode: OscMode) {
            self.xtal_hs_enables.set(self.xtal_hs_enables.get() + 1);
            self.xtal_hs.set(Some(mode));
        }
        fn xtal_hs_disable(&self) {
            self.xtal_hs.set(None);
        }
        fn extref_enable(&self) {
            self.extref_enables.set(self.extref_enables.get() + 1);
            self.extref.set(true);
        }
        fn extref_disable(&self) {
            self.extref.set(false);
        }
        fn hfrc_force_on(&self, on: bool) {
            self.hfrc_on.set(on);
        }
        fn hfadj_apply(&self, adj: &HfrcAdj) -> Result<(), HwFault> {
            fault(&self.fail_hfadj)?;
            self.hfadj.set(Some(*adj));
            Ok(())
        }
        fn hfadj_disable(&self) -> Result<(), HwFault> {
            fault(&self.fail_hfadj_disable)?;
            self.hfadj.set(None);
            Ok(())
        }
        fn hfrc2_force_on(&self, on: bool) {
            self.hfrc2_on.set(on);
        }
        fn hf2adj_apply(&self, adj: &Hfrc2Adj) -> Result<(), HwFault> {
            fault(&self.fail_hf2adj)?;
            self.hf2adj.set(Some(*adj));
            Ok(())
        }
        fn hf2adj_disable(&self) -> Result<(), HwFault> {
            self.hf2adj.set(None);
            Ok(())
        }
        fn syspll_configure(&self, cfg: &SyspllConfig) -> Result<(), HwFault> {
            self.pll.set(Some(*cfg));
            Ok(())
        }
        fn syspll_enable(&self) -> Result<(), HwFault> {
            fault(&self.fail_pll_enable)?;
            self.pll_on.set(true);
            Ok(())
        }
        fn syspll_disable(&self) {
            self.pll_on.set(false);
        }
        fn syspll_lock_wait(&self) -> Result<(), HwFault> {
            fault(&self.fail_lock)
        }
        fn delay_us(&self, us: u32) {
            self.waits.borrow_mut().push(us);
        }
    }

    fn user(id: u8) -> UserId {
        UserId::new(id).unwrap()
    }

    fn manager() -> ClockManager<MockHw> {
        ClockManager::new(MockHw::default(), BoardInfo::default())
    }

    fn with_extref(hz: u32) -> BoardInfo {
        BoardInfo {
            extref_hz: hz,
            ..BoardInfo::default()
        }
    }

    fn traced(m: &ClockManager<MockHw>, t: Trace) -> bool {
        m.with_trace(|r| r.iter().any(|e| e.payload == t))
    }

    #[test]
    fn request_and_release_are_idempotent() {
        let m = manager();
        let a = user(0);
        m.request(ClockId::XtalHs, a).unwrap();
        m.request(ClockId::XtalHs, a).unwrap();
        assert_eq!(m.status(ClockId::XtalHs), 1);
        assert_eq!(m.hw().xtal_hs_enables.get(), 1);
        assert_eq!(m.hw().xtal_hs.get(), Some(OscMode::Xtal));
        assert_eq!(*m.hw().waits.borrow(), [XTAL_HS_STARTUP_US]);

        m.release(ClockId::XtalHs, a);
        m.release(ClockId::XtalHs, a);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert_eq!(m.hw().xtal_hs.get(), None);
    }

    #[test]
    fn reference_stays_on_until_last_user() {
        let m = manager();
        m.request(ClockId::XtalLs, user(0)).unwrap();
        m.request(ClockId::XtalLs, user(1)).unwrap();
        m.release(ClockId::XtalLs, user(0));
        assert_eq!(m.hw().xtal_ls.get(), Some(OscMode::Xtal));
        m.release(ClockId::XtalLs, user(1));
        assert_eq!(m.hw().xtal_ls.get(), None);

        m.request(ClockId::Lfrc, user(0)).unwrap();
        assert_eq!(m.status(ClockId::Lfrc), 1);
    }

    #[test]
    fn absent_reference_is_refused() {
        let m = manager();
        assert_eq!(
            m.request(ClockId::ExtRefClk, user(0)),
            Err(ClkError::InvalidOperation)
        );
        assert_eq!(m.status(ClockId::ExtRefClk), 0);
        assert!(!m.hw().extref.get());

        let m = ClockManager::new(MockHw::default(), with_extref(24_000_000));
        m.request(ClockId::ExtRefClk, user(0)).unwrap();
        assert!(m.hw().extref.get());
    }

    #[test]
    fn crystal_mode_conflict() {
        let m = manager();
        m.hw().xtal_ls.set(Some(OscMode::External));
        assert_eq!(m.request(ClockId::XtalLs, user(0)), Err(ClkError::InUse));
        assert_eq!(m.status(ClockId::XtalLs), 0);
    }

    #[test]
    fn external_xtal_hs_needs_no_startup_wait() {
        let board = BoardInfo {
            xtal_hs: RefClock {
                freq_hz: 32_000_000,
                mode: OscMode::External,
            },
            ..BoardInfo::default()
        };
        let m = ClockManager::new(MockHw::default(), board);
        m.request(ClockId::XtalHs, user(0)).unwrap();
        assert_eq!(m.hw().xtal_hs.get(), Some(OscMode::External));
        assert!(m.hw().waits.borrow().is_empty());
    }

    #[test]
    fn hfrc2_users_share_one_reference_hold() {
        let m = manager();
        m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
        m.request(ClockId::Hfrc2, user(0)).unwrap();
        m.request(ClockId::Hfrc2, user(1)).unwrap();

        assert_eq!(m.status(ClockId::Hfrc2), 2);
        assert_eq!(m.status(ClockId::XtalHs), 1);
        assert!(m.hw().hfrc2_on.get());
        assert_eq!(m.hw().hf2adj.get().map(|a| a.ratio), Some(0xC49BA));
        assert_eq!(
            *m.hw().waits.borrow(),
            [XTAL_HS_STARTUP_US, HFRC2_SETTLE_US]
        );

        m.release(ClockId::Hfrc2, user(0));
        assert!(m.hw().hfrc2_on.get());
        m.release(ClockId::Hfrc2, user(1));
        assert!(!m.hw().hfrc2_on.get());
        assert_eq!(m.hw().hf2adj.get(), None);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert_eq!(m.hw().xtal_hs.get(), None);
    }

    #[test]
    fn hfrc2_adjust_failure_unwinds() {
        let m = manager();
        m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
        m.hw().fail_hf2adj.set(true);
        assert_eq!(m.request(ClockId::Hfrc2, user(0)), Err(ClkError::Hardware));

        assert_eq!(m.status(ClockId::Hfrc2), 0);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert_eq!(m.status(ClockId::ExtRefClk), 0);
        assert_eq!(m.hw().xtal_hs.get(), None);
        assert!(!m.hw().hfrc2_on.get());
        assert!(traced(&m, Trace::Rollback(ClockId::Hfrc2)));

        m.hw().fail_hf2adj.set(false);
        m.request(ClockId::Hfrc2, user(0)).unwrap();
        assert_eq!(m.status(ClockId::XtalHs), 1);
    }

    #[test]
    fn failed_request_keeps_a_hold_it_did_not_make() {
        let m = manager();
        m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
        m.request(ClockId::XtalHs, UserId::HFRC2_DEPENDENCY).unwrap();
        m.hw().fail_hf2adj.set(true);
        assert!(m.request(ClockId::Hfrc2, user(0)).is_err());
        assert_eq!(m.status(ClockId::XtalHs), 1);
    }

    #[test]
    fn missing_dependency_fails_request() {
        let m = manager();
        m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None).unwrap();
        // Still free of reference users, so the board can change under the
        // cached setting.
        m.board_info_set(BoardInfo {
            xtal_ls: RefClock {
                freq_hz: 0,
                mode: OscMode::Xtal,
            },
            ..BoardInfo::default()
        })
        .unwrap();
        assert_eq!(
            m.request(ClockId::Hfrc, user(0)),
            Err(ClkError::InvalidOperation)
        );
        assert_eq!(m.status(ClockId::Hfrc), 0);
        assert!(!m.hw().hfrc_on.get());
    }

    #[test]
    fn reconfigure_while_in_use() {
        let m = manager();
        m.request(ClockId::Hfrc2, user(0)).unwrap();
        assert!(m.hw().hfrc2_on.get());
        assert!(m.hw().waits.borrow().is_empty());

        assert_eq!(
            m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None),
            Err(ClkError::InUse)
        );
        assert_eq!(
            m.config_get(ClockId::Hfrc2).unwrap().freq_hz,
            HFRC2_FREE_RUN_HZ
        );

        m.configure(ClockId::Hfrc2, HFRC2_ADJ_250_HZ, None).unwrap();
        assert!(m.hw().hf2adj.get().is_some());
        assert_eq!(m.status(ClockId::XtalHs), 1);
        assert!(traced(
            &m,
            Trace::Switched {
                clock: ClockId::Hfrc2,
                freq_hz: HFRC2_ADJ_250_HZ
            }
        ));

        m.configure(ClockId::Hfrc2, HFRC2_FREE_RUN_HZ, None).unwrap();
        assert_eq!(m.hw().hf2adj.get(), None);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert!(m.hw().hfrc2_on.get());
    }

    #[test]
    fn hfrc_switches_while_running() {
        let m = manager();
        m.request(ClockId::Hfrc, user(0)).unwrap();
        assert!(m.hw().hfrc_on.get());

        m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None).unwrap();
        assert_eq!(m.hw().hfadj.get(), Some(HfrcAdj { target: 1465 }));
        assert_eq!(m.status(ClockId::XtalLs), 1);
        assert!(m.hw().waits.borrow().contains(&HFRC_SETTLE_US));

        m.release(ClockId::Hfrc, user(0));
        assert!(!m.hw().hfrc_on.get());
        assert_eq!(m.hw().hfadj.get(), None);
        assert_eq!(m.status(ClockId::XtalLs), 0);
        assert_eq!(m.hw().xtal_ls.get(), None);
    }

    #[test]
    fn failed_switch_rolls_back() {
        let m = manager();
        m.request(ClockId::Hfrc, user(0)).unwrap();
        m.hw().fail_hfadj.set(true);
        assert_eq!(
            m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None),
            Err(ClkError::Hardware)
        );
        assert_eq!(
            m.config_get(ClockId::Hfrc),
            Ok(ClockSetting {
                freq_hz: HFRC_FREE_RUN_HZ,
                config: None
            })
        );
        assert_eq!(m.status(ClockId::XtalLs), 0);
        assert!(m.hw().hfrc_on.get());
        assert!(!traced(
            &m,
            Trace::RollbackFailed {
                clock: ClockId::Hfrc,
                error: ClkError::Hardware,
            }
        ));

        m.hw().fail_hfadj_disable.set(true);
        assert_eq!(
            m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None),
            Err(ClkError::Hardware)
        );
        assert!(traced(
            &m,
            Trace::RollbackFailed {
                clock: ClockId::Hfrc,
                error: ClkError::Hardware,
            }
        ));
        assert_eq!(m.status(ClockId::Hfrc), 1);
    }

    #[test]
    fn stop_goes_ahead_when_adjust_sticks() {
        let m = manager();
        m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None).unwrap();
        m.request(ClockId::Hfrc, user(0)).unwrap();
        m.hw().fail_hfadj_disable.set(true);

        m.release(ClockId::Hfrc, user(0));
        assert!(traced(
            &m,
            Trace::StopFailed {
                clock: ClockId::Hfrc,
                error: ClkError::Hardware,
            }
        ));
        assert!(!m.hw().hfrc_on.get());
        assert_eq!(m.status(ClockId::Hfrc), 0);
        assert_eq!(m.status(ClockId::XtalLs), 0);
    }

    #[test]
    fn adjusted_hfrc_settles_on_first_request() {
        let m = manager();
        m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None).unwrap();
        m.request(ClockId::Hfrc, user(3)).unwrap();
        assert_eq!(m.hw().hfadj.get(), Some(HfrcAdj { target: 1465 }));
        assert_eq!(*m.hw().waits.borrow(), [HFRC_SETTLE_US]);
        m.request(ClockId::Hfrc, user(4)).unwrap();
        assert_eq!(m.hw().waits.borrow().len(), 1);
    }

    #[test]
    fn frequencies_are_checked() {
        let m = manager();
        assert_eq!(
            m.configure(ClockId::Hfrc, 47_000_000, None),
            Err(ClkError::OutOfRange)
        );
        assert_eq!(
            m.configure(ClockId::Hfrc2, 100_000_000, None),
            Err(ClkError::OutOfRange)
        );
        assert_eq!(
            m.configure(ClockId::Syspll, 1_000_000_000, None),
            Err(ClkError::OutOfRange)
        );
        assert_eq!(
            m.configure(ClockId::Lfrc, 32_768, None),
            Err(ClkError::InvalidOperation)
        );
        assert_eq!(
            m.config_get(ClockId::XtalHs),
            Err(ClkError::InvalidOperation)
        );
    }

    #[test]
    fn configs_need_their_reference() {
        let bare = BoardInfo {
            xtal_hs: RefClock {
                freq_hz: 0,
                mode: OscMode::Xtal,
            },
            xtal_ls: RefClock {
                freq_hz: 0,
                mode: OscMode::Xtal,
            },
            extref_hz: 0,
        };
        let m = ClockManager::new(MockHw::default(), bare);
        assert_eq!(
            m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, None),
            Err(ClkError::InvalidOperation)
        );
        assert_eq!(m.hfadj_apply(None), Err(ClkError::InvalidOperation));
        assert_eq!(
            m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None),
            Err(ClkError::InvalidOperation)
        );
        assert_eq!(
            m.configure(ClockId::Syspll, 96_000_000, None),
            Err(ClkError::InvalidOperation)
        );
        // Free-running needs nothing.
        m.configure(ClockId::Hfrc2, HFRC2_FREE_RUN_HZ, None).unwrap();

        m.board_info_set(BoardInfo {
            extref_hz: 32_000_000,
            ..bare
        })
        .unwrap();
        m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
        let setting = m.config_get(ClockId::Hfrc2).unwrap();
        assert!(matches!(
            setting.config,
            Some(ClockConfig::Hfrc2(Hfrc2Adj {
                ref_sel: RefSel::ExtRefClk,
                ratio: 0xC49BA,
                ..
            }))
        ));
    }

    #[test]
    fn explicit_config_is_checked() {
        let m = manager();
        let hfrc2 = ClockConfig::Hfrc2(Hfrc2Adj {
            ref_sel: RefSel::ExtRefClk,
            ref_div: 2,
            ratio: 0xC49BA,
        });
        assert_eq!(
            m.configure(ClockId::Hfrc, HFRC_ADJ_48_HZ, Some(hfrc2)),
            Err(ClkError::InvalidArgument)
        );
        // EXTREF_CLK is not fitted on the default board.
        assert_eq!(
            m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, Some(hfrc2)),
            Err(ClkError::InvalidOperation)
        );
    }

    #[test]
    fn syspll_must_be_configured() {
        let m = manager();
        assert_eq!(m.config_get(ClockId::Syspll).unwrap().freq_hz, 0);
        assert_eq!(
            m.request(ClockId::Syspll, user(0)),
            Err(ClkError::NotConfigured)
        );
        assert_eq!(m.status(ClockId::Syspll), 0);
    }

    #[test]
    fn syspll_holds_only_its_selected_reference() {
        let m = ClockManager::new(MockHw::default(), with_extref(32_000_000));
        m.configure(ClockId::Syspll, 96_000_000, None).unwrap();
        m.request(ClockId::Syspll, user(0)).unwrap();

        assert!(m.hw().pll_on.get());
        assert!(matches!(
            m.hw().pll.get(),
            Some(SyspllConfig {
                ref_sel: RefSel::XtalHs,
                ..
            })
        ));
        // Both inputs were up while the PLL started.
        assert_eq!(m.hw().extref_enables.get(), 1);
        assert!(!m.hw().extref.get());
        assert_eq!(m.status(ClockId::XtalHs), 1);
        assert_eq!(m.status(ClockId::ExtRefClk), 0);

        // A second user finds it running and leaves the references alone.
        m.request(ClockId::Syspll, user(1)).unwrap();
        assert_eq!(m.status(ClockId::Syspll), 2);
        assert_eq!(m.hw().extref_enables.get(), 1);
        assert_eq!(m.status(ClockId::XtalHs), 1);

        assert_eq!(
            m.configure(ClockId::Syspll, 48_000_000, None),
            Err(ClkError::InUse)
        );

        m.release(ClockId::Syspll, user(0));
        assert!(m.hw().pll_on.get());
        m.release(ClockId::Syspll, user(1));
        assert!(!m.hw().pll_on.get());
        assert_eq!(m.status(ClockId::XtalHs), 0);
    }

    #[test]
    fn syspll_without_second_reference() {
        let m = manager();
        m.configure(ClockId::Syspll, 96_000_000, None).unwrap();
        m.request(ClockId::Syspll, user(0)).unwrap();
        assert!(m.hw().pll_on.get());
        assert_eq!(m.hw().extref_enables.get(), 0);
    }

    #[test]
    fn syspll_start_failure_releases_references() {
        let m = ClockManager::new(MockHw::default(), with_extref(32_000_000));
        m.configure(ClockId::Syspll, 96_000_000, None).unwrap();
        m.hw().fail_pll_enable.set(true);
        assert_eq!(m.request(ClockId::Syspll, user(0)), Err(ClkError::Hardware));
        assert_eq!(m.status(ClockId::Syspll), 0);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert_eq!(m.status(ClockId::ExtRefClk), 0);
        assert!(!m.hw().pll_on.get());
    }

    #[test]
    fn syspll_lock_failure_rolls_back() {
        let m = manager();
        m.configure(ClockId::Syspll, 96_000_000, None).unwrap();
        m.hw().fail_lock.set(true);
        assert_eq!(m.request(ClockId::Syspll, user(0)), Err(ClkError::Hardware));
        assert_eq!(m.status(ClockId::Syspll), 0);
        assert_eq!(m.status(ClockId::XtalHs), 0);
        assert!(!m.hw().pll_on.get());
        assert!(traced(&m, Trace::LockFailed));

        m.hw().fail_lock.set(false);
        m.request(ClockId::Syspll, user(0)).unwrap();
        assert!(m.hw().pll_on.get());
    }

    #[test]
    fn release_all_drops_every_hold() {
        let m = manager();
        let a = user(0);
        let b = user(1);
        m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
        m.configure(ClockId::Syspll, 96_000_000, None).unwrap();
        for clock in [ClockId::Lfrc, ClockId::XtalLs, ClockId::Hfrc2, ClockId::Syspll] {
            m.request(clock, a).unwrap();
        }
        m.request(ClockId::XtalLs, b).unwrap();
        assert_eq!(m.status(ClockId::XtalHs), 2);

        m.release_all(a);
        for clock in [ClockId::Lfrc, ClockId::Hfrc2, ClockId::Syspll, ClockId::XtalHs] {
            assert_eq!(m.status(clock), 0, "{clock:?}");
        }
        assert_eq!(m.status(ClockId::XtalLs), 1);
        assert!(!m.hw().pll_on.get());
        assert_eq!(m.hw().xtal_hs.get(), None);
    }

    #[test]
    fn board_info_locked_while_references_run() {
        let m = manager();
        m.request(ClockId::XtalLs, user(0)).unwrap();
        assert_eq!(m.board_info_set(with_extref(1)), Err(ClkError::InUse));
        m.release(ClockId::XtalLs, user(0));
        m.board_info_set(with_extref(1)).unwrap();
        assert_eq!(m.board_info_get().extref_hz, 1);
    }

    #[test]
    fn legacy_adjust_helpers() {
        let m = manager();
        m.hfadj_apply(Some(1465)).unwrap();
        assert_eq!(
            m.config_get(ClockId::Hfrc),
            Ok(ClockSetting {
                freq_hz: HFRC_ADJ_48_HZ,
                config: Some(ClockConfig::Hfrc(HfrcAdj { target: 1465 })),
            })
        );
        assert_eq!(m.hfadj_apply(Some(1000)), Err(ClkError::OutOfRange));
        m.hfadj_disable().unwrap();
        assert_eq!(m.config_get(ClockId::Hfrc).unwrap().config, None);
        m.hfadj_apply(None).unwrap();
        assert_eq!(
            m.config_get(ClockId::Hfrc).unwrap().freq_hz,
            HFRC_ADJ_48_HZ
        );

        m.hf2adj_apply().unwrap();
        assert_eq!(
            m.config_get(ClockId::Hfrc2).unwrap().freq_hz,
            HFRC2_ADJ_196P608_HZ
        );
        m.hf2adj_disable().unwrap();
        assert_eq!(
            m.config_get(ClockId::Hfrc2).unwrap().freq_hz,
            HFRC2_FREE_RUN_HZ
        );
    }

    #[test]
    fn guards_nest() {
        let outer = CriticalGuard::new();
        {
            let _inner = CriticalGuard::new();
        }
        let _ = outer.token();
    }

    const PROP_CLOCKS: [ClockId; 3] = [ClockId::Lfrc, ClockId::XtalHs, ClockId::Hfrc2];

    proptest! {
        #[test]
        fn holds_track_requests(
            ops in prop::collection::vec((any::<bool>(), 0..3usize, 0..4u8), 0..64)
        ) {
            let m = manager();
            m.configure(ClockId::Hfrc2, HFRC2_ADJ_196P608_HZ, None).unwrap();
            let mut model: [std::collections::BTreeSet<u8>; 3] = Default::default();

            for (request, which, id) in ops {
                let clock = PROP_CLOCKS[which];
                if request {
                    m.request(clock, user(id)).unwrap();
                    model[which].insert(id);
                } else {
                    m.release(clock, user(id));
                    model[which].remove(&id);
                }

                let hfrc2_users = model[2].len();
                prop_assert_eq!(m.status(ClockId::Lfrc) as usize, model[0].len());
                prop_assert_eq!(m.status(ClockId::Hfrc2) as usize, hfrc2_users);
                prop_assert_eq!(
                    m.status(ClockId::XtalHs) as usize,
                    model[1].len() + usize::from(hfrc2_users > 0)
                );
                prop_assert_eq!(m.hw().xtal_hs.get().is_some(), m.status(ClockId::XtalHs) > 0);
                prop_assert_eq!(m.hw().hfrc2_on.get(), hfrc2_users > 0);
                prop_assert_eq!(m.hw().hf2adj.get().is_some(), hfrc2_users > 0);
            }

            for id in 0..4 {
                m.release_all(user(id));
            }
            for clock in PROP_CLOCKS {
                prop_assert_eq!(m.status(clock), 0);
            }
            prop_assert!(m.hw().xtal_hs.get().is_none());
            prop_assert!(!m.hw().hfrc2_on.get());
        }
    }
}
