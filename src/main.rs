use std::path::PathBuf;
use std::sync::Arc;

use meshroot::{
    certificate::Manager,
    mrc::{
        MeshRootCertificate, MeshRootCertificateSpec, MrcIntent, MrcState, MrcStateMachine, ProviderSpec,
        SecretReference, TresorCaSpec, TresorProviderSpec,
    },
    observability::{init_observability, log_config_info, MetricsRecorder},
    providers::ProviderGenerator,
    rotor::Rotor,
    store::MemoryMrcClient,
    AppConfig, Result, APP_NAME, VERSION,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONFIG_PATH_ENV: &str = "MESHROOT_CONFIG";
const DEFAULT_MRC_NAME: &str = "meshroot-root";
const DEFAULT_CA_SECRET: &str = "meshroot-ca-bundle";
const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Active Tresor root used when no seed file is configured.
fn default_mesh_root_certificate(namespace: &str) -> MeshRootCertificate {
    let mut mrc = MeshRootCertificate::new(
        DEFAULT_MRC_NAME,
        namespace,
        MeshRootCertificateSpec {
            provider: ProviderSpec::Tresor(TresorProviderSpec {
                ca: TresorCaSpec {
                    secret_ref: SecretReference { name: DEFAULT_CA_SECRET.to_string(), namespace: namespace.to_string() },
                },
            }),
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            intent: MrcIntent::Active,
            spiffe_enabled: false,
        },
    );
    mrc.status.state = MrcState::Active;
    mrc
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let config_path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_PATH_ENV).ok()).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    init_observability(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting meshroot certificate manager");
    log_config_info(&config);
    MetricsRecorder::new().register_certificate_metrics();

    let providers = Arc::new(ProviderGenerator::new(config.providers.clone()));
    let store = Arc::new(MemoryMrcClient::new(providers));
    match &config.mrc.seed_file {
        Some(path) => {
            store.load_seed_file(path)?;
        }
        None => {
            store.create(default_mesh_root_certificate(&config.mrc.namespace))?;
        }
    }

    let cancel = CancellationToken::new();
    let manager = Arc::new(Manager::new());

    let state_machine = Arc::new(MrcStateMachine::new(manager.clone(), store, &config.mrc, cancel.clone()));
    let state_machine_task = state_machine.start().await?;

    let rotor_task = Rotor::new(manager.clone(), &config.certificates).spawn(cancel.clone());

    info!(
        trust_domain = %manager.trust_domain().await?,
        "Certificate manager ready"
    );

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();

    for (name, task) in [("mrc_state_machine", state_machine_task), ("rotor", rotor_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Certificate manager shutdown completed");
    Ok(())
}
