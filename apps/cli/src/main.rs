use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use fragment_relay_core_sdk::{
    config::AppConfig,
    llm::{HttpGenerator, StructuredGenerator},
    models::{ChatMessage, MessageContent, ModelConfig, ModelRef, Role},
    schema, server, telemetry, templates,
};

/**
 * \brief CLI 程序入口：启动中继服务，或在终端直接生成片段。
 */
#[derive(Parser, Debug)]
#[command(name = "fragment-relay", version, about = "LLM fragment generation and sandbox relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        /** \brief 监听地址，缺省为 0.0.0.0:$PORT */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 发送一条用户消息并流式显示生成的片段 JSON。
     */
    Generate {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
        /** \brief 仅使用指定模板 */
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        base_url: Option<String>,
    },

    /**
     * \brief 打印生成片段所用的系统提示词。
     */
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init()?;

    match cli.command {
        Commands::Serve { addr } => {
            let config = AppConfig::load().await.context("load config failed")?;
            config.log_summary();
            let addr = addr.unwrap_or_else(|| format!("0.0.0.0:{}", config.port));
            let state = server::AppState::from_config(&config);
            server::run(&addr, state).await?;
        }
        Commands::Generate {
            provider,
            model,
            prompt,
            template,
            temperature,
            max_tokens,
            base_url,
        } => {
            let config = AppConfig::load().await.context("load config failed")?;
            let catalog = match template {
                Some(id) => templates::single(&id)
                    .with_context(|| format!("unknown template: {}", id))?,
                None => templates::registry().clone(),
            };
            let system_prompt = templates::to_prompt(&catalog);
            let model = ModelRef {
                provider_id: provider,
                id: model,
            };
            let model_config = ModelConfig {
                temperature,
                max_tokens,
                base_url,
                ..ModelConfig::default()
            };
            let messages = vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Text(prompt),
            }];

            telemetry::log_event(
                "cli.generate",
                &format!("provider={} model={}", model.provider_id, model.id),
            );

            let generator = HttpGenerator::new(config.keys.clone());
            let mut stream = generator
                .generate_structured(
                    &model,
                    &model_config,
                    &system_prompt,
                    &messages,
                    schema::fragment_schema(),
                )
                .await
                .context("create stream failed")?;

            let mut full = String::new();
            while let Some(delta) = stream
                .as_mut()
                .next()
                .await
                .transpose()
                .context("stream error")?
            {
                print!("{}", delta);
                full.push_str(&delta);
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
            println!();

            if serde_json::from_str::<serde_json::Value>(&full).is_err() {
                telemetry::log_error("cli.generate", "response is not valid JSON");
            }
        }
        Commands::Templates => {
            println!("{}", templates::to_prompt(templates::registry()));
        }
    }

    Ok(())
}
