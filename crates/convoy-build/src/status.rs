//! Build status report
//!
//! Presence and age of the image behind each application service.

use crate::BuildError;
use convoy_core::{Clock, CommandRunner, CommandSpec, ServiceRegistry};
use serde::Serialize;

/// One service's image status
#[derive(Debug, Clone, Serialize)]
pub struct ImageStatus {
    pub service: String,
    pub present: bool,
    pub image_id: Option<String>,
    /// RFC 3339 creation time as reported by the engine
    pub created_at: Option<String>,
    pub size_bytes: u64,
    pub age_hours: Option<f64>,
}

/// Image status across the registry
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub images: Vec<ImageStatus>,
}

impl ImageReport {
    /// Services with no image yet
    pub fn missing(&self) -> Vec<&str> {
        self.images
            .iter()
            .filter(|i| !i.present)
            .map(|i| i.service.as_str())
            .collect()
    }
}

/// Inspect the image behind every application service
pub async fn image_report(
    runner: &dyn CommandRunner,
    clock: &dyn Clock,
    project: &str,
) -> Result<ImageReport, BuildError> {
    let registry = ServiceRegistry::new();
    let mut images = Vec::new();

    for service in registry.application_services() {
        let reference = format!("{project}-{}", service.name);
        let spec = CommandSpec::new("docker").args([
            "image",
            "inspect",
            &reference,
            "--format",
            "{{.Id}}|{{.Created}}|{{.Size}}",
        ]);
        let output = runner.run(spec).await?;
        if !output.success() {
            images.push(ImageStatus {
                service: service.name.clone(),
                present: false,
                image_id: None,
                created_at: None,
                size_bytes: 0,
                age_hours: None,
            });
            continue;
        }

        let line = output.stdout.trim();
        let mut fields = line.splitn(3, '|');
        let id = fields.next().unwrap_or_default().to_string();
        let created = fields.next().unwrap_or_default().to_string();
        let size = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);

        let age_hours = chrono::DateTime::parse_from_rfc3339(&created)
            .ok()
            .map(|created| {
                let age = clock.now().signed_duration_since(created.with_timezone(&chrono::Utc));
                age.num_seconds() as f64 / 3600.0
            });

        images.push(ImageStatus {
            service: service.name.clone(),
            present: true,
            image_id: Some(id),
            created_at: Some(created),
            size_bytes: size,
            age_hours,
        });
    }
    Ok(ImageReport { images })
}
