//! CLI 모듈
//!
//! palank-tenant-rag CLI 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::RagConfig;
use crate::ident::TenantId;
use crate::loader::{SourceKind, SourceSpec};
use crate::retrieval::RetrievalOutcome;
use crate::service::KnowledgeService;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "palank-tenant-rag")]
#[command(version, about = "멀티 테넌트 벡터 지식 저장소", long_about = None)]
pub struct Cli {
    /// 설정 파일 (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 테넌트 저장소 생성 (이미 있으면 그대로)
    Provision {
        #[arg(short, long)]
        tenant: String,
    },

    /// 지식 소스 등록 + 인제스트
    Register {
        #[arg(short, long)]
        tenant: String,

        /// 소스 표시 이름
        #[arg(short, long)]
        name: String,

        /// 소스 종류 (text, file, directory, web_scraper, airtable)
        #[arg(short, long)]
        kind: String,

        /// 임베딩 모델 ID
        #[arg(short, long, default_value = "gemini-embedding-001")]
        model: String,

        /// 연결 설정 (JSON object)
        #[arg(long)]
        settings: Option<String>,

        /// 연결 설정 개별 지정 (key=value, 반복 가능)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// 등록된 소스 목록
    Sources {
        #[arg(short, long)]
        tenant: String,
    },

    /// 소스 인제스트 이력
    History {
        #[arg(short, long)]
        tenant: String,

        /// 소스 테이블 이름
        table: String,
    },

    /// 여러 소스에서 검색
    Query {
        #[arg(short, long)]
        tenant: String,

        /// 검색 쿼리
        query: String,

        /// 검색할 소스 테이블 (생략하면 전체)
        #[arg(short = 's', long = "source")]
        sources: Vec<String>,

        /// 결과 개수 제한
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// 소스 삭제 (테이블 + 카탈로그)
    Delete {
        #[arg(short, long)]
        tenant: String,

        /// 소스 테이블 이름
        table: String,
    },

    /// 소스를 다른 모델로 재임베딩
    Reembed {
        #[arg(short, long)]
        tenant: String,

        /// 소스 테이블 이름
        table: String,

        /// 새 임베딩 모델 ID
        #[arg(short, long)]
        model: String,
    },

    /// 테넌트 저장소 삭제
    Teardown {
        #[arg(short, long)]
        tenant: String,

        /// 확인 없이 삭제
        #[arg(long)]
        yes: bool,
    },

    /// 사용 가능한 임베딩 모델
    Models,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = RagConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;
    let service = KnowledgeService::from_config(config).context("서비스 초기화 실패")?;

    match cli.command {
        Commands::Provision { tenant } => cmd_provision(&service, &tenant).await,
        Commands::Register {
            tenant,
            name,
            kind,
            model,
            settings,
            set,
        } => cmd_register(&service, &tenant, &name, &kind, &model, settings, &set).await,
        Commands::Sources { tenant } => cmd_sources(&service, &tenant).await,
        Commands::History { tenant, table } => cmd_history(&service, &tenant, &table).await,
        Commands::Query {
            tenant,
            query,
            sources,
            limit,
        } => cmd_query(&service, &tenant, &query, sources, limit).await,
        Commands::Delete { tenant, table } => cmd_delete(&service, &tenant, &table).await,
        Commands::Reembed {
            tenant,
            table,
            model,
        } => cmd_reembed(&service, &tenant, &table, &model).await,
        Commands::Teardown { tenant, yes } => cmd_teardown(&service, &tenant, yes).await,
        Commands::Models => cmd_models(&service),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn parse_tenant(raw: &str) -> Result<TenantId> {
    TenantId::parse(raw).with_context(|| format!("잘못된 테넌트 ID: {}", raw))
}

/// 테넌트 생성 명령어 (provision)
async fn cmd_provision(service: &KnowledgeService, tenant: &str) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let store = service
        .ensure_tenant_store(&tenant)
        .await
        .context("테넌트 저장소 생성 실패")?;

    println!("[OK] 테넌트 준비됨: {}", tenant);
    println!("     위치: {}", store.dir().display());
    Ok(())
}

/// 소스 등록 명령어 (register)
async fn cmd_register(
    service: &KnowledgeService,
    tenant: &str,
    name: &str,
    kind: &str,
    model: &str,
    settings: Option<String>,
    set: &[String],
) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let kind: SourceKind = kind.parse().context("잘못된 소스 종류")?;
    let settings = build_settings(settings.as_deref(), set)?;
    let spec = SourceSpec::new(name, kind, settings, model);

    println!("[*] 소스 등록 중: {} ({}, {})", name, kind, model);

    let registered = service
        .register_source(&tenant, &spec)
        .await
        .context("소스 등록 실패")?;
    let report = &registered.report;

    println!("[OK] 등록 완료: {}", registered.source.table_name);
    println!(
        "     문서: {}/{} 로드 | 청크: {} | {} | {:.1}s",
        report.documents_loaded,
        report.documents_total,
        report.chunk_count,
        format_bytes(report.total_bytes),
        report.elapsed.as_secs_f64()
    );

    if !report.skipped.is_empty() {
        println!("[!] 건너뛴 문서 {} 건:", report.skipped.len());
        for skipped in report.skipped.iter().take(10) {
            println!("     - {}: {}", skipped.origin, truncate_text(&skipped.reason, 80));
        }
        if report.skipped.len() > 10 {
            println!("     ... 외 {} 건", report.skipped.len() - 10);
        }
    }

    Ok(())
}

/// 소스 목록 명령어 (sources)
async fn cmd_sources(service: &KnowledgeService, tenant: &str) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let sources = service
        .list_sources(&tenant)
        .await
        .context("소스 목록 조회 실패")?;

    if sources.is_empty() {
        println!("[!] 등록된 소스가 없습니다.");
        return Ok(());
    }

    println!("[OK] 등록된 소스 ({} 건):\n", sources.len());

    for source in sources {
        println!("  {} [{}]", truncate_text(&source.display_name, 40), source.source_kind);
        println!("        테이블: {}", source.table_name);
        println!(
            "        모델: {} (dim={}) | {}",
            source.embedding_model_id,
            source.embedding_dimension,
            source.updated_at.format("%Y-%m-%d %H:%M")
        );
        println!();
    }

    Ok(())
}

/// 인제스트 이력 명령어 (history)
async fn cmd_history(service: &KnowledgeService, tenant: &str, table: &str) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let source = service
        .get_source(&tenant, table)
        .await
        .context("소스 조회 실패")?
        .ok_or_else(|| anyhow::anyhow!("소스 '{}'를 찾을 수 없습니다", table))?;

    let runs = service
        .ingestion_history(&tenant, &source.id)
        .await
        .context("이력 조회 실패")?;

    if runs.is_empty() {
        println!("[!] 인제스트 이력이 없습니다.");
        return Ok(());
    }

    println!("[OK] {} 인제스트 이력 ({} 건):\n", source.display_name, runs.len());

    for run in runs {
        println!(
            "  #{:<4} [{}] {} | 청크 {} | 문서 {}/{}",
            run.id,
            run.status.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.chunk_count,
            run.documents_loaded,
            run.documents_total
        );
        if let Some(error) = &run.error {
            println!("        에러: {}", truncate_text(error, 120));
        }
    }

    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(
    service: &KnowledgeService,
    tenant: &str,
    query: &str,
    sources: Vec<String>,
    limit: Option<usize>,
) -> Result<()> {
    let tenant = parse_tenant(tenant)?;

    let tables = if sources.is_empty() {
        service
            .list_sources(&tenant)
            .await
            .context("소스 목록 조회 실패")?
            .into_iter()
            .map(|s| s.table_name.to_string())
            .collect()
    } else {
        sources
    };

    if tables.is_empty() {
        println!("[!] 검색할 소스가 없습니다.");
        return Ok(());
    }

    println!("[*] 검색 중: \"{}\" ({} 소스)", query, tables.len());

    let outcome = service
        .query(&tenant, &tables, query, limit)
        .await
        .context("검색 실패")?;

    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &RetrievalOutcome) {
    for degraded in &outcome.degraded {
        println!(
            "[!] 소스 제외됨: {} ({})",
            degraded
                .source_name
                .as_deref()
                .unwrap_or(degraded.table_name.as_str()),
            degraded.failure
        );
    }

    if outcome.hits.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return;
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", outcome.hits.len());

    for (i, hit) in outcome.hits.iter().enumerate() {
        println!("{}. [점수: {:.4}] {}", i + 1, hit.score, hit.source_name);

        if let Some(origin) = hit.metadata.get("source").and_then(Value::as_str) {
            println!("   출처: {}", origin);
        }
        println!("   내용: {}", truncate_text(&hit.content, 200));
        println!();
    }
}

/// 삭제 명령어 (delete)
async fn cmd_delete(service: &KnowledgeService, tenant: &str, table: &str) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let deleted = service
        .delete_source(&tenant, table)
        .await
        .context("소스 삭제 실패")?;

    if deleted {
        println!("[OK] 소스 삭제됨: {}", table);
    } else {
        println!("[!] 삭제할 소스를 찾을 수 없습니다");
    }
    Ok(())
}

/// 재임베딩 명령어 (reembed)
async fn cmd_reembed(
    service: &KnowledgeService,
    tenant: &str,
    table: &str,
    model: &str,
) -> Result<()> {
    let tenant = parse_tenant(tenant)?;

    println!("[*] 재임베딩 중: {} → {}", table, model);

    let registered = service
        .reembed_source(&tenant, table, model)
        .await
        .context("재임베딩 실패")?;

    println!("[OK] 새 테이블: {}", registered.source.table_name);
    println!(
        "     청크: {} | dim={}",
        registered.report.chunk_count, registered.source.embedding_dimension
    );
    Ok(())
}

/// 테넌트 삭제 명령어 (teardown)
async fn cmd_teardown(service: &KnowledgeService, tenant: &str, yes: bool) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    if !yes {
        bail!("테넌트 '{}'의 모든 데이터가 삭제됩니다. --yes로 확인하세요", tenant);
    }

    if service
        .teardown_tenant(&tenant)
        .await
        .context("테넌트 삭제 실패")?
    {
        println!("[OK] 테넌트 삭제됨: {}", tenant);
    } else {
        println!("[!] 테넌트가 없습니다: {}", tenant);
    }
    Ok(())
}

/// 모델 목록 명령어 (models)
fn cmd_models(service: &KnowledgeService) -> Result<()> {
    println!("palank-tenant-rag v{}", env!("CARGO_PKG_VERSION"));
    println!("[*] 데이터 디렉토리: {}\n", service.config().data_dir.display());

    for spec in service.registry().models() {
        let credential = if spec.requires_credential {
            "키 필요"
        } else {
            "로컬"
        };
        println!(
            "  {:<26} {:<8} dim={:<5} {}",
            spec.model_id, spec.provider, spec.dimension, credential
        );
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `--settings` JSON과 `--set key=value`를 합친 연결 설정
fn build_settings(json: Option<&str>, pairs: &[String]) -> Result<Value> {
    let mut settings = match json {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("--settings JSON 파싱 실패")?;
            match value {
                Value::Object(map) => map,
                _ => bail!("--settings는 JSON object여야 합니다"),
            }
        }
        None => serde_json::Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("--set 형식은 key=value 입니다: {}", pair);
        };
        // JSON으로 읽히면 그대로 (배열, 숫자, bool), 아니면 문자열
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        settings.insert(key.trim().to_string(), value);
    }

    Ok(Value::Object(settings))
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        let truncated = truncate_text(korean, 5);
        assert_eq!(truncated, "안녕하세요...");
    }

    #[test]
    fn test_build_settings_merges_pairs() {
        let settings = build_settings(
            Some(r#"{"urls": ["https://a.example"]}"#),
            &[
                "requests_per_second=2".to_string(),
                "path=/tmp/docs".to_string(),
                "urls=[\"https://b.example\"]".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(settings["requests_per_second"], json!(2));
        assert_eq!(settings["path"], json!("/tmp/docs"));
        assert_eq!(settings["urls"], json!(["https://b.example"]));
    }

    #[test]
    fn test_build_settings_rejects_bad_input() {
        assert!(build_settings(Some("[1, 2]"), &[]).is_err());
        assert!(build_settings(Some("{not json"), &[]).is_err());
        assert!(build_settings(None, &["no-equals".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_register() {
        let cli = Cli::try_parse_from([
            "palank-tenant-rag",
            "register",
            "--tenant",
            "acme",
            "--name",
            "Docs",
            "--kind",
            "text",
            "--model",
            "local-hash",
            "--set",
            "text=hello",
        ])
        .unwrap();

        match cli.command {
            Commands::Register { tenant, set, model, .. } => {
                assert_eq!(tenant, "acme");
                assert_eq!(model, "local-hash");
                assert_eq!(set, vec!["text=hello".to_string()]);
            }
            _ => panic!("expected register"),
        }
    }
}
