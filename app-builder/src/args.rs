use clap::Parser;
use std::path::PathBuf;

/// Build server configuration, provided through the build pod's environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on; the ":8081" form binds all interfaces.
    #[arg(long, env = "ADDR", default_value = ":8081")]
    pub addr: String,

    /// Directory the source tree is unpacked into and built from.
    #[arg(long, env = "BUILD_DIR", default_value = "/tmp/build")]
    pub build_dir: PathBuf,

    /// Shared-secret token from the credentials secret. Stored and passed
    /// through; not part of the admission decision.
    #[arg(long, env = "TOKEN", default_value = "")]
    pub token: String,

    /// Namespace of the App being built.
    #[arg(long, env = "APP_NAMESPACE")]
    pub app_namespace: String,

    /// Name of the App being built.
    #[arg(long, env = "APP_NAME")]
    pub app_name: String,

    /// Registry the built image is pushed to.
    #[arg(long, env = "IMAGE_REGISTRY")]
    pub image_registry: String,
}
