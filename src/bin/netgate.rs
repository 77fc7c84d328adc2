use clap::Parser;
use dotenv::dotenv;
use netgate::{
    setup_tracing, AppResult, DispatchRegistry, EngineConfig, HandlerContext, NetworkEngine,
};
use std::path::PathBuf;
use tokio::runtime;
use tokio::signal;
use tracing::info;

/// message id answered by the built-in echo handler
const ECHO_MESSAGE_ID: u16 = 1;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _log_guard = setup_tracing("logs");

    //setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let engine_config = EngineConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", engine_config);
        return Ok(());
    }

    let mut dispatch = DispatchRegistry::new();
    dispatch.register(ECHO_MESSAGE_ID, |ctx: &HandlerContext<'_>| {
        ctx.reply(ECHO_MESSAGE_ID, ctx.body)
    });

    rt.block_on(async move {
        let mut engine = NetworkEngine::new(engine_config, dispatch)?;
        engine.start().await?;

        let _ = signal::ctrl_c().await;
        info!("get shutdown signal");

        engine.shutdown().await;
        Ok(())
    })
}
