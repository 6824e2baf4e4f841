use std::sync::Arc;

use azure_iot_provisioning::{
    AttestationMaterial, DeviceIdentity, HttpTransport, ProvisioningConfig,
    ProvisioningDeviceClient, ProvisioningState, SymmetricKeyMaterial,
};
use log::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scope_id = std::env::var("DPS_SCOPE_ID").expect(
        "Set the device provisioning service scope id in the DPS_SCOPE_ID environment variable",
    );
    let registration_id = std::env::var("DPS_REGISTRATION_ID").expect("Set the device provisioning service registration id in the DPS_REGISTRATION_ID environment variable");

    // Group enrollments hand out the group key, individual enrollments the device key
    let material = match std::env::var("DPS_GROUP_KEY") {
        Ok(group_key) => SymmetricKeyMaterial::from_group_key(&group_key, &registration_id)?,
        Err(_) => SymmetricKeyMaterial::new(
            std::env::var("DPS_DEVICE_KEY").expect(
                "Set the device key in DPS_DEVICE_KEY or the group key in DPS_GROUP_KEY",
            ),
            None,
        ),
    };

    let config = ProvisioningConfig::new(scope_id.as_str());
    let transport = Arc::new(HttpTransport::new(&config)?);
    let identity = DeviceIdentity::new(
        registration_id,
        AttestationMaterial::SymmetricKey(material),
    );

    let client = ProvisioningDeviceClient::builder()
        .device(scope_id, identity)
        .config(config)
        .transport(transport)
        .status_callback(|state, reason| match reason {
            Some(reason) => error!("Provisioning {}: {}", state, reason),
            None => info!("Provisioning {}", state),
        })
        .build()?;

    client.set_registration_callback(|registration| {
        info!(
            "Device {} assigned to {} with payload {:?}",
            registration.device_id, registration.assigned_hub, registration.payload
        );
    });

    if client.run() != ProvisioningState::Assigned {
        return Err("device was not provisioned".into());
    }

    Ok(())
}
