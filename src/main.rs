use clap::Parser;

use psbt_cosigner_cli::cli::{CliArgs, parse_network, run};
use psbt_cosigner_cli::error::AppError;

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let cli_network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {:?}", cli_network);

    run(args.command, cli_network).map_err(|e| {
        log::error!("処理に失敗しました: {}", e);
        e
    })?;

    log::info!("処理が正常に完了しました。");
    Ok(())
}
