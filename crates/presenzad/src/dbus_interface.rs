use crate::service::{Service, ServiceError};
use presenza_core::IdentityId;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the Presenza attendance daemon.
///
/// Bus name: org.presenza.Attendance1
/// Object path: /org/presenza/Attendance1
pub struct AttendanceService {
    service: Arc<Service>,
}

impl AttendanceService {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    match err {
        ServiceError::NotReady => {
            zbus::fdo::Error::Failed("service is still initializing".into())
        }
        ServiceError::UnknownIdentity(_)
        | ServiceError::NoReferenceImages
        | ServiceError::NoFaceFound(_)
        | ServiceError::MultipleFacesFound { .. }
        | ServiceError::ImageRead { .. } => zbus::fdo::Error::InvalidArgs(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn parse_id(id: &str) -> zbus::fdo::Result<IdentityId> {
    id.parse()
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("not an identity id: {id}")))
}

#[interface(name = "org.presenza.Attendance1")]
impl AttendanceService {
    /// Enroll a new identity from one or more reference images on disk.
    /// Returns the new identity's UUID.
    async fn enroll(&self, name: String, image_paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(name, images = image_paths.len(), "enroll requested");
        let service = Arc::clone(&self.service);
        let id = tokio::task::spawn_blocking(move || {
            let paths: Vec<PathBuf> = image_paths.iter().map(PathBuf::from).collect();
            service.enroll_identity(&name, &paths)
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Remove an enrolled identity and its attendance history.
    /// Returns false if the identity was not enrolled.
    async fn remove_identity(&self, id: String) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        let identity = parse_id(&id)?;
        let service = Arc::clone(&self.service);
        let outcome = tokio::task::spawn_blocking(move || service.remove_identity(identity))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        match outcome {
            Ok(()) => Ok(true),
            Err(ServiceError::UnknownIdentity(_)) => Ok(false),
            Err(err) => Err(to_fdo(err)),
        }
    }

    /// Today's attendance rows as a JSON array.
    async fn today_report(&self) -> zbus::fdo::Result<String> {
        let service = Arc::clone(&self.service);
        let rows = tokio::task::spawn_blocking(move || service.today_report())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(to_fdo)?;
        serde_json::to_string(&rows).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "ready": self.service.is_ready(),
            "enrolled_identities": self.service.identity_count(),
        })
        .to_string())
    }
}
