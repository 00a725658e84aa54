//! Slots every device answers.

use std::future::Future;

use karabo_bus::{arg, reply, SlotCall};
use karabo_data::schema::{AssemblyRules, ACCESS_ALL};
use karabo_data::time::TimeTick;
use karabo_data::{Hash, KaraboError, Result, ValidationRules, Validator, Violation};
use tracing::{debug, info};

use super::Device;

const SIGNALS: [&str; 3] = ["signalChanged", "signalStateChanged", "signalSchemaUpdated"];

fn violation_hash(violation: &Violation) -> Hash {
    Hash::new()
        .with("path", violation.path.as_str())
        .with("kind", violation.kind.as_str())
        .with("message", violation.message.as_str())
}

impl Device {
    /// Register an ungated slot whose body gets the device.
    fn builtin<F, Fut>(&self, name: &str, body: F)
    where
        F: Fn(Device, SlotCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Hash>> + Send + 'static,
    {
        let weak = self.downgrade();
        self.inner.ss.register_slot(name, move |call| {
            let device = weak.upgrade();
            let fut = device.map(|d| body(d, call));
            async move {
                match fut {
                    Some(fut) => fut.await,
                    None => Err(KaraboError::Canceled("device is gone".into())),
                }
            }
        });
    }

    pub(super) fn register_builtin_slots(&self) {
        for signal in SIGNALS {
            self.inner.ss.register_signal(signal);
        }

        self.builtin("slotReconfigure", |device, call| async move {
            let (changes,) = call.args::<(Hash,)>()?;
            let (accepted, rejected) = device.reconfigure(&call.caller, changes).await?;
            reply((accepted, rejected))
        });

        self.builtin("slotGetConfiguration", |device, _call| async move {
            reply((device.configuration(), device.device_id().to_string()))
        });

        self.builtin("slotGetConfigurationSlice", |device, call| async move {
            let (paths,) = call.args::<(Vec<String>,)>()?;
            reply((device.configuration_slice(&paths),))
        });

        self.builtin("slotGetSchema", |device, call| async move {
            let only_current_state = arg::<bool>(&call.body, "a1").unwrap_or(false);
            let schema = if only_current_state {
                let rules = AssemblyRules::new(ACCESS_ALL, device.state().name(), -1);
                device.full_schema().sub_schema_by_rules(&rules)
            } else {
                device.full_schema()
            };
            reply((schema, device.device_id().to_string()))
        });

        self.builtin("slotKillDevice", |device, call| async move {
            info!(device_id = %device.device_id(), caller = %call.caller, "Kill requested");
            device.spawn_kill();
            reply(())
        });

        self.builtin("slotClearLock", |device, _call| async move {
            device.set("lockedBy", "").await?;
            reply(())
        });

        self.builtin("slotTimeTick", |device, call| async move {
            let (train_id, sec, frac, period_us) = call.args::<(u64, u64, u64, u64)>()?;
            let tick = TimeTick {
                train_id,
                sec,
                frac,
                period_us,
            };
            device.inner.clock.tick(tick);
            device.inner.logic.on_time_update(&device, tick).await;
            reply(())
        });

        self.builtin("slotGetTime", |device, _call| async move {
            let now = device.timestamp();
            let mut time = Hash::new();
            let node = time.set("time", true);
            now.to_attributes(node.attributes_mut());
            reply((time,))
        });
    }

    /// Validate `changes` in the current state and apply what passes.
    ///
    /// Returns the accepted paths and one Hash per rejected key. A device
    /// locked by another instance refuses everything.
    pub async fn reconfigure(&self, caller: &str, changes: Hash) -> Result<(Vec<String>, Vec<Hash>)> {
        let _serial = self.inner.reconfigure.lock().await;
        let locked_by = self.get::<String>("lockedBy").unwrap_or_default();
        if !locked_by.is_empty() && locked_by != caller {
            return Err(KaraboError::DisallowedState(format!(
                "{} is locked by {locked_by}",
                self.device_id()
            )));
        }

        let state = self.state();
        let report = {
            let params = self.inner.params.read();
            Validator::new(ValidationRules::reconfiguration(state))
                .with_timestamp(self.timestamp())
                .validate(&params.full, &changes)
        };
        let reconfigurable = report.has_reconfigurable_parameter();
        let rejected: Vec<Hash> = report.violations.iter().map(violation_hash).collect();
        let mut accepted = report.validated;

        if !accepted.is_empty() {
            self.inner.logic.pre_reconfigure(self, &mut accepted).await?;
            self.publish(accepted.clone(), reconfigurable).await?;
            self.reconnect_inputs(&accepted);
            self.inner.logic.post_reconfigure(self).await?;
        }
        debug!(
            device_id = %self.device_id(),
            caller = caller,
            accepted = accepted.paths().len(),
            rejected = rejected.len(),
            "Reconfigured"
        );
        Ok((accepted.paths(), rejected))
    }
}
