mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, RunArgs};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));

    match command {
        Command::Run(args) => cmd_run(args),
        Command::LoginGemini => cmd_login(claudish_provider::oauth::gemini_oauth_config()),
        Command::LoginKimi => cmd_login(claudish_provider::oauth::kimi_oauth_config()),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let _guard = claudish_core::logging::init_logging(&args.log_level, args.log_to_file, None);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(&args)?;
        application.serve(args.enable).await
    })
}

fn cmd_login(config: claudish_provider::oauth::OAuthConfig) -> anyhow::Result<()> {
    let _guard = claudish_core::logging::init_logging("info", false, None);
    let device_flow = config.device_auth_url.is_some();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let paths = claudish_core::paths::Paths::new()?;
        let manager = claudish_provider::oauth::OAuthManager::new(config, paths);
        let http = reqwest::Client::new();
        if device_flow {
            manager.login_device(&http).await?;
        } else {
            manager.login_pkce(&http).await?;
        }
        println!("Logged in to {}.", manager.provider());
        Ok(())
    })
}
