use crate::boards::{BoardDialect, CircuitCommand, ControllerFamily, check_setpoint};
use crate::config::{ConfigPlanner, ConfigRequest};
use crate::error::EquipmentError;
use crate::model::{Category, Chlorinator, ConfigVersion, EquipmentModel, Pump, Schedule};
use crate::protocol::{Frame, Outbound};
use crate::valuemap::{EquipmentIdRange, EquipmentIds, InvalidIdSet, ValueMaps};

/// Standalone operation with no physical panel. Commands validate exactly like the
/// real families and then apply straight to the model; nothing touches the wire.
pub struct VirtualDialect {
    ids: EquipmentIds,
    maps: ValueMaps,
}

impl VirtualDialect {
    pub fn new() -> Self {
        let ids = EquipmentIds {
            circuits: EquipmentIdRange::fixed(1, 40),
            features: EquipmentIdRange::fixed(41, 50),
            pumps: EquipmentIdRange::fixed(1, 8),
            circuit_groups: crate::boards::touch::installed_circuit_groups(),
            virtual_circuits: EquipmentIdRange::fixed(128, 136),
            schedules: EquipmentIdRange::fixed(1, 99),
            invalid_ids: InvalidIdSet::default(),
        };
        Self { ids, maps: crate::boards::touch::value_maps() }
    }
}

impl Default for VirtualDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPlanner for VirtualDialect {
    fn plan(
        &self,
        _local: &ConfigVersion,
        _remote: &ConfigVersion,
        _model: &EquipmentModel,
    ) -> Vec<ConfigRequest> {
        // Nothing to fetch; the reconciler commits the vector directly.
        Vec::new()
    }

    fn poll_message(&self, _category: Category, _item: u8) -> Outbound {
        // Unreachable in practice since planning never yields items.
        Outbound::new(0, Vec::new())
    }

    fn classify_ack(&self, _frame: &Frame) -> Option<(Category, u8)> {
        None
    }
}

impl BoardDialect for VirtualDialect {
    fn family(&self) -> ControllerFamily {
        ControllerFamily::Virtual
    }

    fn equipment_ids(&self) -> &EquipmentIds {
        &self.ids
    }

    fn value_maps(&self) -> &ValueMaps {
        &self.maps
    }

    fn applies_on_ack(&self) -> bool {
        false
    }

    fn build_circuit_state(
        &self,
        model: &EquipmentModel,
        id: u8,
        on: bool,
    ) -> Result<CircuitCommand, EquipmentError> {
        if !self.ids.is_valid_circuit(model, id) {
            return Err(EquipmentError::InvalidId { id, equipment: "circuit" });
        }
        Ok(CircuitCommand { outbound: None, id, on })
    }

    fn build_heat_setpoint(
        &self,
        model: &EquipmentModel,
        body: u8,
        setpoint: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        model
            .body(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?;
        check_setpoint(model.temp_units, body, setpoint)?;
        Ok(None)
    }

    fn build_heat_mode(
        &self,
        model: &EquipmentModel,
        body: u8,
        _mode: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        model
            .body(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?;
        Ok(None)
    }

    fn build_pump(
        &self,
        _model: &EquipmentModel,
        _pump: &Pump,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(None)
    }

    fn build_chlorinator(
        &self,
        _model: &EquipmentModel,
        _chlorinator: &Chlorinator,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(None)
    }

    fn build_schedule(
        &self,
        _model: &EquipmentModel,
        _schedule: &Schedule,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(None)
    }

    fn build_light_theme(
        &self,
        _model: &EquipmentModel,
        _circuit: u8,
        _theme: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(None)
    }

    fn decode_version_frame(&self, _frame: &Frame) -> Option<ConfigVersion> {
        None
    }

    fn apply_status_frame(&self, _model: &mut EquipmentModel, _frame: &Frame) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_matches_the_real_families() {
        let dialect = VirtualDialect::new();
        let model = EquipmentModel::default();
        let command = dialect.build_circuit_state(&model, 12, true).unwrap();
        assert!(command.outbound.is_none());
        assert!(dialect.build_circuit_state(&model, 60, true).is_err());
        // No bodies configured yet.
        assert!(matches!(
            dialect.build_heat_setpoint(&model, 1, 80),
            Err(EquipmentError::NotFound { .. })
        ));
    }
}
