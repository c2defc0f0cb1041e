use crate::{
    BackendConfig, BdevError, BdevErrorKind, BdevResult, DeleteTask, Device, VolumeClient,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

enum Slot {
    /// Name reserved while the remote open is in flight.
    Creating,
    Registered(Device),
}

type Slots = Arc<Mutex<BTreeMap<String, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, BTreeMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host-facing entry point: creates, looks up and deletes named devices.
pub struct Backend {
    client: Arc<dyn VolumeClient>,
    config: BackendConfig,
    slots: Slots,
}

impl Backend {
    pub fn new(client: Arc<dyn VolumeClient>, config: BackendConfig) -> BdevResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            slots: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn config(&self) -> BackendConfig {
        self.config
    }

    /// Create and register a device named `name` over `pool/image`.
    ///
    /// The name stays reserved for the whole remote open, so concurrent creates of one name
    /// cannot both succeed. A failed create leaves no trace in the registry.
    pub async fn create_device(
        &self,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
    ) -> BdevResult<Device> {
        for (field, value) in [("name", name), ("pool", pool), ("image", image)] {
            if value.is_empty() {
                return Err(BdevError::with_message(
                    BdevErrorKind::InvalidConfig,
                    format!("device {field} missing"),
                ));
            }
        }
        let reservation = Reservation::take(&self.slots, name)?;
        let device = Device::create(
            self.client.as_ref(),
            name,
            pool,
            image,
            block_size,
            self.config,
        )
        .await?;
        reservation.commit(device.clone());
        Ok(device)
    }

    /// Start deleting `device`; see [`Device::delete`].
    ///
    /// The name is released right before `on_done` runs.
    pub fn delete_device<F>(&self, device: &Device, on_done: F) -> BdevResult<DeleteTask>
    where
        F: FnOnce(BdevResult<()>) + Send + 'static,
    {
        let slots = self.slots.clone();
        let target = device.clone();
        device.delete(move |result| {
            let mut guard = lock(&slots);
            if let Some(Slot::Registered(registered)) = guard.get(target.name()) {
                if registered.ptr_eq(&target) {
                    guard.remove(target.name());
                }
            }
            drop(guard);
            debug!(device = target.name(), "device unregistered");
            on_done(result);
        })
    }

    pub fn get_device(&self, name: &str) -> BdevResult<Device> {
        match lock(&self.slots).get(name) {
            Some(Slot::Registered(device)) => Ok(device.clone()),
            _ => Err(BdevError::with_message(
                BdevErrorKind::DeviceNotFound,
                format!("no device named {name}"),
            )),
        }
    }

    /// Registered devices ordered by name, including ones still being deleted.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Registered(device) => Some(device.clone()),
                Slot::Creating => None,
            })
            .collect()
    }
}

/// Releases a reserved name unless the create succeeded.
struct Reservation {
    slots: Slots,
    name: String,
    committed: bool,
}

impl Reservation {
    fn take(slots: &Slots, name: &str) -> BdevResult<Self> {
        let mut guard = lock(slots);
        if guard.contains_key(name) {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidConfig,
                format!("device {name} already exists"),
            ));
        }
        guard.insert(name.to_owned(), Slot::Creating);
        Ok(Self {
            slots: slots.clone(),
            name: name.to_owned(),
            committed: false,
        })
    }

    fn commit(mut self, device: Device) {
        lock(&self.slots).insert(self.name.clone(), Slot::Registered(device));
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            lock(&self.slots).remove(&self.name);
        }
    }
}
