// Build descriptor detection in a fetched source tree

use std::path::Path;

use crate::models::BuildDescriptor;

/// Multi-service descriptors win over a single Dockerfile.
const COMPOSE_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
const DOCKERFILE: &str = "Dockerfile";

/// Find the build descriptor at the root of `dir`. `None` means the tree cannot be built.
pub async fn detect(dir: &Path) -> Option<BuildDescriptor> {
    for name in COMPOSE_FILES {
        let path = dir.join(name);
        if is_file(&path).await {
            return Some(BuildDescriptor::Compose(path));
        }
    }
    let dockerfile = dir.join(DOCKERFILE);
    is_file(&dockerfile)
        .await
        .then_some(BuildDescriptor::Dockerfile(dockerfile))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file())
}
