use crate::config::{self, ConfigPlanner, Reconciler, Tuning};
use crate::error::EquipmentError;
use crate::model::{
    Category, Chlorinator, ConfigVersion, EquipmentModel, Pump, Schedule, TempUnits,
};
use crate::protocol::{Frame, Outbound};
use crate::valuemap::{EquipmentIds, ValueMap, ValueMaps, derive_heat_modes};
use std::sync::{Arc, Mutex};
use strum::IntoEnumIterator as _;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod aqualink;
pub mod intellicenter;
pub mod touch;
pub mod virtual_board;

/// The controller product line detected on the bus (or chosen explicitly).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ControllerFamily {
    Intellicenter,
    Intellitouch,
    Easytouch,
    Suntouch,
    Aqualink,
    /// No physical panel; all state lives in the local model.
    Virtual,
}

/// What a circuit command resolved to after interlocks.
///
/// The commanded circuit may differ from the requested one: on shared-body panels a
/// pool-on request while the spa runs becomes a spa-off command instead.
#[derive(Debug)]
pub struct CircuitCommand {
    pub outbound: Option<Outbound>,
    pub id: u8,
    pub on: bool,
}

/// Per-family strategy: wire payload construction, id address spaces, value tables
/// and how configuration polls look on this product line.
///
/// Builders validate synchronously and return `Ok(None)`-flavored commands only for
/// families with nothing to put on the wire; validation failures never reach the
/// transport.
pub trait BoardDialect: ConfigPlanner {
    fn family(&self) -> ControllerFamily;

    fn equipment_ids(&self) -> &EquipmentIds;

    fn value_maps(&self) -> &ValueMaps;

    /// Whether model mutations wait for the panel's ack. Families that answer
    /// nothing get their mutations applied right after the frame is out.
    fn applies_on_ack(&self) -> bool;

    fn build_circuit_state(
        &self,
        model: &EquipmentModel,
        id: u8,
        on: bool,
    ) -> Result<CircuitCommand, EquipmentError>;

    fn build_heat_setpoint(
        &self,
        model: &EquipmentModel,
        body: u8,
        setpoint: u8,
    ) -> Result<Option<Outbound>, EquipmentError>;

    fn build_heat_mode(
        &self,
        model: &EquipmentModel,
        body: u8,
        mode: u8,
    ) -> Result<Option<Outbound>, EquipmentError>;

    fn build_pump(
        &self,
        model: &EquipmentModel,
        pump: &Pump,
    ) -> Result<Option<Outbound>, EquipmentError>;

    fn build_chlorinator(
        &self,
        model: &EquipmentModel,
        chlorinator: &Chlorinator,
    ) -> Result<Option<Outbound>, EquipmentError>;

    fn build_schedule(
        &self,
        model: &EquipmentModel,
        schedule: &Schedule,
    ) -> Result<Option<Outbound>, EquipmentError>;

    fn build_light_theme(
        &self,
        model: &EquipmentModel,
        circuit: u8,
        theme: u8,
    ) -> Result<Option<Outbound>, EquipmentError>;

    /// Extracts a remote version vector from an unsolicited frame, when this family
    /// announces configuration counters at all.
    fn decode_version_frame(&self, frame: &Frame) -> Option<ConfigVersion>;

    /// Folds a status broadcast into the model.
    fn apply_status_frame(&self, model: &mut EquipmentModel, frame: &Frame);
}

/// Setpoint bounds shared by every family that heats water.
pub(crate) fn check_setpoint(
    units: TempUnits,
    body: u8,
    setpoint: u8,
) -> Result<(), EquipmentError> {
    let (min, max) = match units {
        TempUnits::Fahrenheit => (40, 104),
        TempUnits::Celsius => (4, 40),
    };
    if setpoint < min || setpoint > max {
        return Err(EquipmentError::InvalidData {
            id: body,
            equipment: "body",
            field: "setpoint",
            value: setpoint as i32,
        });
    }
    Ok(())
}

/// Everything a board adapter needs from the rest of the system: the shared
/// equipment model and the one way onto the wire.
#[derive(Clone)]
pub struct SystemContext {
    pub model: Arc<Mutex<EquipmentModel>>,
    pub bus: crate::bus::BusHandle,
}

impl SystemContext {
    pub fn lock_model(&self) -> std::sync::MutexGuard<'_, EquipmentModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn delegate_planner(dialect: Arc<dyn BoardDialect>) -> Arc<dyn ConfigPlanner> {
    struct DialectPlanner(Arc<dyn BoardDialect>);
    impl ConfigPlanner for DialectPlanner {
        fn plan(
            &self,
            local: &ConfigVersion,
            remote: &ConfigVersion,
            model: &EquipmentModel,
        ) -> Vec<config::ConfigRequest> {
            self.0.plan(local, remote, model)
        }
        fn poll_message(&self, category: Category, item: u8) -> Outbound {
            self.0.poll_message(category, item)
        }
        fn classify_ack(&self, frame: &Frame) -> Option<(Category, u8)> {
            self.0.classify_ack(frame)
        }
        fn apply(&self, model: &mut EquipmentModel, category: Category, frame: &Frame) {
            self.0.apply(model, category, frame);
        }
    }
    Arc::new(DialectPlanner(dialect))
}

/// The strategy object for one controller family.
pub fn dialect_for(family: ControllerFamily) -> Arc<dyn BoardDialect> {
    match family {
        ControllerFamily::Intellicenter => Arc::new(intellicenter::IntelliCenterDialect::new()),
        ControllerFamily::Intellitouch => Arc::new(touch::TouchDialect::intellitouch()),
        ControllerFamily::Easytouch => Arc::new(touch::TouchDialect::easytouch()),
        ControllerFamily::Suntouch => Arc::new(touch::TouchDialect::suntouch()),
        ControllerFamily::Aqualink => Arc::new(aqualink::AquaLinkDialect::new()),
        ControllerFamily::Virtual => Arc::new(virtual_board::VirtualDialect::new()),
    }
}

/// One attached controller. Owns the family dialect, the reconciler task and the
/// inbound frame pump; torn down wholesale (and replaced) when a different panel is
/// detected on the bus.
pub struct BoardAdapter {
    dialect: Arc<dyn BoardDialect>,
    ctx: SystemContext,
    cancel: CancellationToken,
    versions: UnboundedSender<ConfigVersion>,
    progress: watch::Receiver<config::Progress>,
    /// Recomputed from the installed heater mix and swapped wholesale, never edited.
    heat_modes: Arc<Mutex<ValueMap>>,
}

impl BoardAdapter {
    pub fn attach(
        family: ControllerFamily,
        ctx: SystemContext,
        tuning: Tuning,
        frames: UnboundedReceiver<Frame>,
    ) -> BoardAdapter {
        let dialect = dialect_for(family);
        info!(
            message = "attaching board adapter",
            %family,
            acked_commands = dialect.applies_on_ack(),
        );
        let cancel = CancellationToken::new();
        let handles = Reconciler::spawn(
            ctx.bus.clone(),
            Arc::clone(&ctx.model),
            delegate_planner(Arc::clone(&dialect)),
            tuning,
            cancel.child_token(),
        );
        let heat_modes = Arc::new(Mutex::new(derive_heat_modes(&ctx.lock_model().heaters)));
        Self::spawn_inbound(
            Arc::clone(&dialect),
            ctx.clone(),
            handles.versions.clone(),
            Arc::clone(&heat_modes),
            cancel.child_token(),
            frames,
        );
        BoardAdapter {
            dialect,
            ctx,
            cancel,
            versions: handles.versions,
            progress: handles.progress,
            heat_modes,
        }
    }

    fn spawn_inbound(
        dialect: Arc<dyn BoardDialect>,
        ctx: SystemContext,
        versions: UnboundedSender<ConfigVersion>,
        heat_modes: Arc<Mutex<ValueMap>>,
        cancel: CancellationToken,
        mut frames: UnboundedReceiver<Frame>,
    ) {
        tokio::task::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => return,
                    },
                };
                if let Some(remote) = dialect.decode_version_frame(&frame) {
                    debug!(message = "version notification", action = frame.action);
                    let _ = versions.send(remote);
                } else {
                    let mut model = ctx.lock_model();
                    dialect.apply_status_frame(&mut model, &frame);
                    let modes = derive_heat_modes(&model.heaters);
                    drop(model);
                    *heat_modes.lock().unwrap_or_else(|e| e.into_inner()) = modes;
                }
            }
        });
    }

    pub fn family(&self) -> ControllerFamily {
        self.dialect.family()
    }

    pub fn dialect(&self) -> &dyn BoardDialect {
        &*self.dialect
    }

    pub fn progress(&self) -> watch::Receiver<config::Progress> {
        self.progress.clone()
    }

    /// Stops the reconciler, the inbound pump and ignores any in-flight outcome.
    pub fn detach(&self) {
        self.cancel.cancel();
    }

    /// Forces a full configuration fetch for families that never announce version
    /// counters on their own (the Touch lines).
    pub fn request_configuration(&self) {
        let local = self.ctx.lock_model().versions;
        let mut remote = local;
        for category in Category::iter() {
            remote.set(category, local.get(category).wrapping_add(1).max(1));
        }
        let _ = self.versions.send(remote);
    }

    /// Current heat mode table, derived from the installed heater mix.
    pub fn heat_modes(&self) -> ValueMap {
        self.heat_modes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn refresh_heat_modes(&self) {
        let modes = derive_heat_modes(&self.ctx.lock_model().heaters);
        *self.heat_modes.lock().unwrap_or_else(|e| e.into_inner()) = modes;
    }

    pub async fn set_circuit_state(&self, id: u8, on: bool) -> Result<(), EquipmentError> {
        let command = {
            let model = self.ctx.lock_model();
            self.dialect.build_circuit_state(&model, id, on)?
        };
        if let Some(outbound) = command.outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        model.circuit_entry(command.id).is_on = command.on;
        Ok(())
    }

    /// Flips the circuit relative to the model's last known state and returns the
    /// state that was commanded.
    pub async fn toggle_circuit_state(&self, id: u8) -> Result<bool, EquipmentError> {
        let target = {
            let model = self.ctx.lock_model();
            !model.circuit(id).is_some_and(|c| c.is_on)
        };
        self.set_circuit_state(id, target).await?;
        Ok(target)
    }

    pub async fn set_heat_setpoint(
        &self,
        body: u8,
        setpoint: u8,
    ) -> Result<(), EquipmentError> {
        let outbound = {
            let model = self.ctx.lock_model();
            self.dialect.build_heat_setpoint(&model, body, setpoint)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        model
            .body_mut(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?
            .setpoint = setpoint;
        Ok(())
    }

    pub async fn set_heat_mode(&self, body: u8, mode: u8) -> Result<(), EquipmentError> {
        if !self.heat_modes().val_exists(mode) {
            return Err(EquipmentError::InvalidData {
                id: body,
                equipment: "body",
                field: "heatMode",
                value: mode as i32,
            });
        }
        let outbound = {
            let model = self.ctx.lock_model();
            self.dialect.build_heat_mode(&model, body, mode)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        model
            .body_mut(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?
            .heat_mode = mode;
        Ok(())
    }

    pub async fn set_pump(&self, pump: Pump) -> Result<(), EquipmentError> {
        let outbound = {
            let model = self.ctx.lock_model();
            if !self.dialect.equipment_ids().pumps.is_in_range(&model, pump.id) {
                return Err(EquipmentError::InvalidId { id: pump.id, equipment: "pump" });
            }
            self.dialect.build_pump(&model, &pump)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        match model.pumps.iter_mut().find(|p| p.id == pump.id) {
            Some(existing) => *existing = pump,
            None => {
                model.pumps.push(pump);
                model.pumps.sort_by_key(|p| p.id);
            }
        }
        Ok(())
    }

    pub async fn set_chlorinator(
        &self,
        chlorinator: Chlorinator,
    ) -> Result<(), EquipmentError> {
        for (field, value) in [
            ("poolSetpoint", chlorinator.pool_setpoint),
            ("spaSetpoint", chlorinator.spa_setpoint),
        ] {
            if value > 100 {
                return Err(EquipmentError::InvalidData {
                    id: chlorinator.id,
                    equipment: "chlorinator",
                    field,
                    value: value as i32,
                });
            }
        }
        let outbound = {
            let model = self.ctx.lock_model();
            self.dialect.build_chlorinator(&model, &chlorinator)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        match model.chlorinators.iter_mut().find(|c| c.id == chlorinator.id) {
            Some(existing) => *existing = chlorinator,
            None => model.chlorinators.push(chlorinator),
        }
        Ok(())
    }

    /// Creates or updates a schedule. An id of 0 allocates the first free slot in
    /// the family's schedule range; the effective id is returned.
    pub async fn set_schedule(&self, mut schedule: Schedule) -> Result<u8, EquipmentError> {
        let outbound = {
            let model = self.ctx.lock_model();
            if schedule.id == 0 {
                schedule.id = model.next_schedule_id().ok_or(EquipmentError::InvalidData {
                    id: 0,
                    equipment: "schedule",
                    field: "id",
                    value: 0,
                })?;
            } else if !self
                .dialect
                .equipment_ids()
                .schedules
                .is_in_range(&model, schedule.id)
            {
                return Err(EquipmentError::InvalidId {
                    id: schedule.id,
                    equipment: "schedule",
                });
            }
            if !self.dialect.equipment_ids().is_valid_circuit(&model, schedule.circuit) {
                return Err(EquipmentError::InvalidId {
                    id: schedule.circuit,
                    equipment: "circuit",
                });
            }
            for (field, minutes) in
                [("startTime", schedule.start_time), ("endTime", schedule.end_time)]
            {
                if minutes >= 24 * 60 {
                    return Err(EquipmentError::InvalidData {
                        id: schedule.id,
                        equipment: "schedule",
                        field,
                        value: minutes as i32,
                    });
                }
            }
            self.dialect.build_schedule(&model, &schedule)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let id = schedule.id;
        let mut model = self.ctx.lock_model();
        match model.schedules.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = schedule,
            None => {
                model.schedules.push(schedule);
                model.schedules.sort_by_key(|s| s.id);
            }
        }
        Ok(id)
    }

    /// Applies a color theme to a light-function circuit.
    pub async fn set_light_theme(&self, circuit: u8, theme: u8) -> Result<(), EquipmentError> {
        let outbound = {
            let model = self.ctx.lock_model();
            let target = model
                .circuit(circuit)
                .ok_or(EquipmentError::NotFound { id: circuit, equipment: "circuit" })?;
            let function = self.dialect.value_maps().circuit_functions.transform(target.function);
            if !function.is_light {
                return Err(EquipmentError::InvalidData {
                    id: circuit,
                    equipment: "circuit",
                    field: "function",
                    value: target.function as i32,
                });
            }
            if !self.dialect.value_maps().light_themes.val_exists(theme) {
                return Err(EquipmentError::InvalidData {
                    id: circuit,
                    equipment: "circuit",
                    field: "theme",
                    value: theme as i32,
                });
            }
            self.dialect.build_light_theme(&model, circuit, theme)?
        };
        if let Some(outbound) = outbound {
            config::expect_ack(self.ctx.bus.send(outbound).await)?;
        }
        let mut model = self.ctx.lock_model();
        if let Some(target) = model.circuit_mut(circuit) {
            target.theme = Some(theme);
        }
        Ok(())
    }
}

impl Drop for BoardAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
