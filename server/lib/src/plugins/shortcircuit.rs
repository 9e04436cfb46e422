// Short-circuit control handling. A request carrying this control asks the
// server to stop processing in pre_parse and answer with a caller chosen
// result code. Exists for exercising the hook pipeline; production
// deployments simply never register it.

use crate::event::find_control;
use crate::plugins::{OpKindSet, Plugin, PluginCapability, PluginDisposition, PluginPhase};
use crate::prelude::*;
use crate::proto::PluginError;
use crate::server::DirectoryServer;

pub const OID_SHORT_CIRCUIT: &str = "1.3.6.1.4.1.54321.3.1";

#[derive(Default)]
pub struct ShortCircuit;

impl ShortCircuit {
    pub fn new() -> Self {
        ShortCircuit
    }

    /// Build the control a caller attaches to request a short circuit.
    pub fn control(rc: ResultCode) -> Control {
        Control::new(
            OID_SHORT_CIRCUIT,
            true,
            Some(rc.to_wire().to_be_bytes().to_vec()),
        )
    }
}

impl Plugin for ShortCircuit {
    fn id(&self) -> &'static str {
        "short_circuit"
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        vec![PluginCapability::new(PluginPhase::PreParse, OpKindSet::all())]
    }

    fn pre_parse(
        &self,
        _server: &DirectoryServer,
        kind: OperationKind,
        _ident: &Identity,
        controls: &[Control],
    ) -> Result<PluginDisposition, OperationError> {
        let Some(control) = find_control(controls, OID_SHORT_CIRCUIT) else {
            return Ok(PluginDisposition::Continue);
        };
        // The control value is opaque until here: four big endian bytes of
        // result code.
        let bytes = control
            .value
            .as_deref()
            .and_then(|v| <[u8; 4]>::try_from(v).ok())
            .ok_or_else(|| {
                OperationError::Plugin(PluginError::ShortCircuit(
                    "malformed control value".to_string(),
                ))
            })?;
        let rc = ResultCode::from_wire(u32::from_be_bytes(bytes));
        debug!(%kind, ?rc, "short circuit requested");
        Ok(PluginDisposition::Stop(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{setup_test_server, test_person};

    #[test]
    fn test_short_circuit_stops_operation() {
        let server = setup_test_server(vec![Arc::new(ShortCircuit::new()) as Arc<dyn Plugin>]);

        // A short circuit with a failure code surfaces that code and the
        // entry is never written.
        let mut ce = AddEvent::new_internal(test_person("u1"));
        ce.controls.push(ShortCircuit::control(ResultCode::UnwillingToPerform));
        assert_eq!(
            server.add(&ce),
            Err(OperationError::ShortCircuited(ResultCode::UnwillingToPerform))
        );
        assert!(!server
            .entry_exists(&dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());

        // A success short circuit skips processing and reports success.
        let mut ce = AddEvent::new_internal(test_person("u1"));
        ce.controls.push(ShortCircuit::control(ResultCode::Success));
        assert_eq!(server.add(&ce), Ok(()));
        assert!(!server
            .entry_exists(&dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());

        // Operations without the control are unaffected.
        server.internal_add(test_person("u1")).expect("add");
        assert!(server
            .entry_exists(&dn!("uid=u1,ou=people,dc=example,dc=com"))
            .unwrap());

        // A malformed control value is a plugin error.
        let mut ce = AddEvent::new_internal(test_person("u2"));
        ce.controls.push(Control::new(OID_SHORT_CIRCUIT, true, Some(vec![1, 2])));
        assert_eq!(
            server.add(&ce),
            Err(OperationError::Plugin(PluginError::ShortCircuit(
                "malformed control value".to_string()
            )))
        );
        server.shutdown();
    }
}
