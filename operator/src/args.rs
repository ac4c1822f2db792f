use clap::Parser;

/// Configuration shared by both controllers.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Docker daemon endpoint handed to build pods.
    #[arg(long, env = "DOCKER_HOST", default_value = "tcp://docker:2375")]
    pub docker_host: String,

    /// Image registry used when a resource does not override it.
    #[arg(
        long,
        env = "DEFAULT_IMAGE_REGISTRY",
        default_value = "registry.manor-system.svc"
    )]
    pub default_image_registry: String,

    /// Image run by the build pods.
    #[arg(
        long,
        env = "APP_BUILDER_IMAGE",
        default_value = "codelogia/app-builder:latest"
    )]
    pub app_builder_image: String,
}
