use clap::Parser;
use cluster_diag::{
    init_errors,
    App,
    Args,
};
use color_eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    init_errors()?;
    App::new(Args::parse())?.run().await
}
