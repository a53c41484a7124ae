/*
 * verwatch - Concurrent Upstream Version Checker
 * Copyright (c) 2026 verwatch developers
 * 
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use verwatch::{
    config::Config,
    error::AppResult,
    http::ReqwestTransport,
    services::Runner,
    sources::SourceRegistry,
    tools,
};

/// 有条目失败且指定了 `--failures` 时的退出码
const EXIT_FAILURES: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "verwatch", version, about = "检查上游软件的新版本")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    check: CheckArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 检查全部条目（默认）
    Check(CheckArgs),
    /// 将新版本记录写入旧版本文件
    Take(TakeArgs),
    /// 比较新旧版本文件
    Cmp(CmpArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LoggerFormat {
    Pretty,
    Json,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// 配置文件，默认为 $XDG_CONFIG_HOME/verwatch/verwatch.toml
    #[arg(short = 'c', long = "file")]
    file: Option<PathBuf>,

    /// 日志级别（RUST_LOG 优先）
    #[arg(short = 'l', long = "logging", default_value = "info")]
    logging: String,

    /// 日志格式
    #[arg(long, value_enum, default_value_t = LoggerFormat::Pretty)]
    logger: LoggerFormat,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// 每个请求的最多尝试次数
    #[arg(short = 't', long, default_value_t = 1)]
    tries: u32,

    /// 只检查指定条目，可重复
    #[arg(short = 'e', long = "entry")]
    entries: Vec<String>,

    /// 有条目失败时以状态码 3 退出
    #[arg(long)]
    failures: bool,
}

#[derive(Args, Debug)]
struct TakeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// 复制全部新版本记录
    #[arg(long)]
    all: bool,

    /// 条目名称，或 `name=version` 指定版本
    #[arg(value_name = "NAME")]
    names: Vec<String>,
}

#[derive(Args, Debug)]
struct CmpArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// 同时列出没有变化的条目
    #[arg(long)]
    all: bool,
}

/// 初始化日志，输出到标准错误
fn init_logging(common: &CommonArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("verwatch={}", common.logging)));
    let registry = tracing_subscriber::registry().with(filter);
    match common.logger {
        LoggerFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LoggerFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn load_config(common: &CommonArgs) -> AppResult<Config> {
    let path = common.file.clone().unwrap_or_else(Config::default_path);
    info!("加载配置文件: {}", path.display());
    Config::from_file(&path)
}

async fn run_check(args: CheckArgs) -> AppResult<ExitCode> {
    let mut config = load_config(&args.common)?;
    if !args.entries.is_empty() {
        config.retain_entries(&args.entries)?;
    }

    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(
        config.settings.http_timeout,
    )));
    let runner = Runner::new(config, Arc::new(SourceRegistry::builtin()), transport)
        .with_tries(args.tries);
    let outcome = runner.check().await?;

    if args.failures && outcome.has_failures {
        return Ok(ExitCode::from(EXIT_FAILURES));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_take(args: TakeArgs) -> AppResult<ExitCode> {
    let config = load_config(&args.common)?;
    if args.names.is_empty() && !args.all {
        error!("未指定条目，使用 --all 复制全部记录");
        return Ok(ExitCode::FAILURE);
    }
    let taken = tools::take(&config.settings, &args.names, args.all).await?;
    info!("已更新 {} 条旧版本记录", taken.len());
    Ok(ExitCode::SUCCESS)
}

async fn run_cmp(args: CmpArgs) -> AppResult<ExitCode> {
    let config = load_config(&args.common)?;
    for diff in tools::cmp(&config.settings, args.all).await? {
        println!("{}", diff);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Check(cli.check));

    let common = match &command {
        Command::Check(args) => &args.common,
        Command::Take(args) => &args.common,
        Command::Cmp(args) => &args.common,
    };
    init_logging(common);

    let result = match command {
        Command::Check(args) => run_check(args).await,
        Command::Take(args) => run_take(args).await,
        Command::Cmp(args) => run_cmp(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_subcommand_is_check() {
        let cli = Cli::try_parse_from(["verwatch", "-c", "a.toml", "-t", "3", "-e", "x", "-e", "y", "--failures"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.check.tries, 3);
        assert_eq!(cli.check.entries, vec!["x", "y"]);
        assert!(cli.check.failures);
    }

    #[test]
    fn test_take_and_cmp_arguments() {
        let cli = Cli::try_parse_from(["verwatch", "take", "-c", "a.toml", "foo", "bar=1.0"]).unwrap();
        match cli.command {
            Some(Command::Take(args)) => assert_eq!(args.names, vec!["foo", "bar=1.0"]),
            other => panic!("unexpected {:?}", other),
        }
        let cli = Cli::try_parse_from(["verwatch", "cmp", "--all", "--logger", "json"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Cmp(ref args)) if args.all && args.common.logger == LoggerFormat::Json));
    }
}
