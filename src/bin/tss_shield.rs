use anyhow::Result;
use std::sync::Arc;
use tigris_shield::{ShieldContext, config::Settings, run};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let ctx: Arc<ShieldContext> = ShieldContext::bootstrap(settings).await?;
    run(ctx).await
}
