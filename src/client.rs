use std::fmt;
use std::future::Future;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Runtime};

use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::parser::{RegistrationResponse, RegistrationStatus};
use crate::register::{Authenticator, OperationId, Registration};
use crate::security::DeviceIdentity;
use crate::status::StatusPoller;
use crate::transport::ProvisioningTransport;

/// Progress of a device through provisioning
///
/// States only move forward, except that any non terminal state may fall into
/// [`ProvisioningState::Error`]. `Assigned` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProvisioningState {
    ///
    Unauthenticated,
    ///
    ReadyToAuthenticate,
    /// The service accepted the attestation and returned an operation id
    Authenticated,
    /// Waiting for the service to assign a hub
    Assigning,
    /// The device has a hub
    Assigned,
    /// Provisioning failed, the status callback carries the reason
    Error,
}

impl ProvisioningState {
    ///
    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisioningState::Assigned | ProvisioningState::Error)
    }

    /// Whether the state machine may move from `self` to `next`
    pub fn can_transition_to(self, next: ProvisioningState) -> bool {
        !self.is_terminal() && (next == ProvisioningState::Error || next > self)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ProvisioningState::Unauthenticated => "unauthenticated",
            ProvisioningState::ReadyToAuthenticate => "ready to authenticate",
            ProvisioningState::Authenticated => "authenticated",
            ProvisioningState::Assigning => "assigning",
            ProvisioningState::Assigned => "assigned",
            ProvisioningState::Error => "error",
        };
        f.write_str(state)
    }
}

/// Final outcome of a successful registration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationInfo {
    /// Host name of the IoT hub the device was assigned to
    pub assigned_hub: String,
    /// Device id to connect to the hub with
    pub device_id: String,
    ///
    pub state: ProvisioningState,
    /// Custom payload returned by the allocation policy
    pub payload: Option<Value>,
}

/// Receives every state transition with an optional reason
pub type StatusCallback = Box<dyn Fn(ProvisioningState, Option<String>) + Send + Sync>;
/// Receives the registration result once the device is assigned
pub type RegistrationCallback = Box<dyn FnOnce(RegistrationInfo) + Send>;

/// Registers a device with the device provisioning service
///
/// [`ProvisioningDeviceClient::run`] attests the device once, then polls the
/// service at a fixed interval until the registration is assigned or fails.
/// Network round trips run on a small worker pool while `run` blocks the calling
/// thread with a bounded wait on each of them. Failures are reported once through
/// the status callback and never retried, call `run` again to start over.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use azure_iot_provisioning::{
///     AttestationMaterial, DeviceIdentity, HttpTransport, ProvisioningConfig,
///     ProvisioningDeviceClient, SymmetricKeyMaterial,
/// };
///
/// # fn main() -> azure_iot_provisioning::Result<()> {
/// let config = ProvisioningConfig::new("0ne000EEBBD");
/// let identity = DeviceIdentity::new(
///     "FirstDevice",
///     AttestationMaterial::SymmetricKey(SymmetricKeyMaterial::new("TheDeviceKey", None)),
/// );
/// let transport = Arc::new(HttpTransport::new(&config)?);
///
/// let client = ProvisioningDeviceClient::new(config, identity, transport, |state, reason| {
///     println!("{} {:?}", state, reason);
/// })?;
/// client.set_registration_callback(|info| println!("assigned to {}", info.assigned_hub));
/// client.run();
/// # Ok(())
/// # }
/// ```
pub struct ProvisioningDeviceClient {
    config: Arc<ProvisioningConfig>,
    identity: Arc<DeviceIdentity>,
    transport: Arc<dyn ProvisioningTransport>,
    authenticator: Arc<Authenticator>,
    status_callback: StatusCallback,
    registration_callback: Mutex<Option<RegistrationCallback>>,
    state: Mutex<ProvisioningState>,
    running: Mutex<()>,
    pool: Mutex<Option<Runtime>>,
}

impl fmt::Debug for ProvisioningDeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningDeviceClient")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl ProvisioningDeviceClient {
    /// Create a provisioning client
    ///
    /// # Arguments
    ///
    /// * `config` - Service endpoint, id scope and timing parameters
    /// * `identity` - The registration id and how it is attested
    /// * `transport` - Protocol used to reach the provisioning service
    /// * `status_callback` - Invoked on every state transition
    pub fn new<F>(
        config: ProvisioningConfig,
        identity: DeviceIdentity,
        transport: Arc<dyn ProvisioningTransport>,
        status_callback: F,
    ) -> crate::Result<ProvisioningDeviceClient>
    where
        F: Fn(ProvisioningState, Option<String>) + Send + Sync + 'static,
    {
        config.validate()?;
        if identity.registration_id().is_empty() {
            return Err(ProvisioningError::Client(
                "registration id cannot be empty".to_owned(),
            ));
        }

        let pool = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("azure-iot-provisioning")
            .enable_all()
            .build()?;

        let config = Arc::new(config);
        let identity = Arc::new(identity);
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(&config),
            Arc::clone(&identity),
            Arc::clone(&transport),
        ));

        Ok(ProvisioningDeviceClient {
            config,
            identity,
            transport,
            authenticator,
            status_callback: Box::new(status_callback),
            registration_callback: Mutex::new(None),
            state: Mutex::new(ProvisioningState::Unauthenticated),
            running: Mutex::new(()),
            pool: Mutex::new(Some(pool)),
        })
    }

    /// Set where the registration result is delivered
    ///
    /// The callback is consumed when the device is assigned, so it fires at most once.
    pub fn set_registration_callback<F>(&self, callback: F)
    where
        F: FnOnce(RegistrationInfo) + Send + 'static,
    {
        *self
            .registration_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// The state the client is currently in
    pub fn state(&self) -> ProvisioningState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the whole registration, blocking until a terminal state is reached
    ///
    /// Returns [`ProvisioningState::Assigned`] or [`ProvisioningState::Error`]. After a
    /// failure, calling `run` again starts over from the top. Once the device is
    /// assigned, further calls return immediately without contacting the service.
    pub fn run(&self) -> ProvisioningState {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ProvisioningState::Assigned {
                info!(
                    "{} is already assigned, not registering again",
                    self.identity.registration_id()
                );
                return ProvisioningState::Assigned;
            }
            *state = ProvisioningState::Unauthenticated;
        }
        (self.status_callback)(ProvisioningState::Unauthenticated, None);

        if let Err(err) = self.execute() {
            error!(
                "Provisioning of {} failed: {}",
                self.identity.registration_id(),
                err
            );
            self.fail(err);
        }

        self.state()
    }

    /// Shut down the worker pool immediately
    ///
    /// In flight round trips are cancelled and a running [`ProvisioningDeviceClient::run`]
    /// ends in [`ProvisioningState::Error`]. The client cannot run again afterwards.
    pub fn close(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            info!("Shutting down the provisioning worker pool");
            pool.shutdown_background();
        }
    }

    fn execute(&self) -> crate::Result<()> {
        self.advance(ProvisioningState::ReadyToAuthenticate)?;

        let (registration, operation_id) = self.invoke_register()?;
        self.advance(ProvisioningState::Authenticated)?;

        let mut response = registration.response;
        if response.status != RegistrationStatus::Assigned {
            self.advance(ProvisioningState::Assigning)?;

            let poller = Arc::new(StatusPoller::new(
                self.identity.registration_id(),
                Arc::clone(&self.transport),
                registration.authorization,
            ));

            loop {
                response = self.invoke_status(&poller, &operation_id)?;
                match response.status {
                    RegistrationStatus::Assigned => break,
                    RegistrationStatus::Assigning | RegistrationStatus::Unassigned => {
                        debug!("Registration of {} is still {}", operation_id, response.status)
                    }
                    _ => return Err(rejection(&response)),
                }
            }
        }

        let info = registration_info(response)?;
        self.advance(ProvisioningState::Assigned)?;

        let callback = self
            .registration_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => callback(info),
            None => warn!("Device was assigned but no registration callback is set"),
        }

        Ok(())
    }

    fn invoke_register(&self) -> crate::Result<(Registration, OperationId)> {
        let authenticator = Arc::clone(&self.authenticator);
        let registration = self.dispatch(
            "registration",
            self.config.registration_timeout,
            async move { authenticator.authenticate().await },
        )?;

        let response = &registration.response;
        match response.status {
            RegistrationStatus::Assigning | RegistrationStatus::Assigned => {}
            _ => return Err(rejection(response)),
        }

        let operation_id = registration.operation_id().ok_or_else(|| {
            ProvisioningError::Authentication(
                "operation id could not be retrieved from the registration response".to_owned(),
            )
        })?;

        Ok((registration, operation_id))
    }

    fn invoke_status(
        &self,
        poller: &Arc<StatusPoller>,
        operation_id: &OperationId,
    ) -> crate::Result<RegistrationResponse> {
        let poller = Arc::clone(poller);
        let operation_id = operation_id.clone();
        let interval = self.config.poll_interval;

        self.dispatch(
            "status poll",
            interval + self.config.status_timeout,
            async move {
                tokio::time::sleep(interval).await;
                poller.poll(&operation_id).await
            },
        )
    }

    /// Run `work` on the worker pool and wait at most `bound` for its result
    fn dispatch<T, F>(&self, task: &str, bound: Duration, work: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: Future<Output = crate::Result<T>> + Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        let handle = {
            let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            let pool = pool.as_ref().ok_or_else(|| {
                ProvisioningError::Execution("worker pool has been shut down".to_owned())
            })?;
            pool.spawn(async move {
                let _ = tx.send(work.await);
            })
        };

        match rx.recv_timeout(bound) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                handle.abort();
                Err(ProvisioningError::Execution(format!(
                    "{} did not complete within {:?}",
                    task, bound
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ProvisioningError::Execution(format!(
                "{} was cancelled before completing",
                task
            ))),
        }
    }

    fn advance(&self, next: ProvisioningState) -> crate::Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.can_transition_to(next) {
                return Err(ProvisioningError::Client(format!(
                    "cannot move from {} to {}",
                    *state, next
                )));
            }
            *state = next;
        }

        info!(
            "Provisioning of {} is {}",
            self.identity.registration_id(),
            next
        );
        (self.status_callback)(next, None);
        Ok(())
    }

    fn fail(&self, err: ProvisioningError) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() {
                warn!("Ignoring failure after reaching {}: {}", *state, err);
                return;
            }
            *state = ProvisioningState::Error;
        }

        (self.status_callback)(ProvisioningState::Error, Some(err.to_string()));
    }
}

impl Drop for ProvisioningDeviceClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn rejection(response: &RegistrationResponse) -> ProvisioningError {
    ProvisioningError::HubRejected(
        response
            .error_message
            .clone()
            .unwrap_or_else(|| format!("registration ended with status {}", response.status)),
    )
}

fn registration_info(response: RegistrationResponse) -> crate::Result<RegistrationInfo> {
    match (response.assigned_hub, response.device_id) {
        (Some(assigned_hub), Some(device_id)) => Ok(RegistrationInfo {
            assigned_hub,
            device_id,
            state: ProvisioningState::Assigned,
            payload: response.payload,
        }),
        _ => Err(ProvisioningError::Client(
            "assigned registration is missing the hub or device id".to_owned(),
        )),
    }
}
