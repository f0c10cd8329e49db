use clap::Parser;
use color_eyre::Result;
use flood::{
    init_errors,
    init_logging,
    App,
    Args,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_errors()?;
    let args = Args::parse();
    let save_config = args.save_config;
    let app = App::new(args)?;
    init_logging(app.config())?;
    if save_config {
        app.config().save()?;
    }
    app.run().await
}
