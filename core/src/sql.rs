//! SQL entry point.
//!
//! Table maintenance commands (`OPTIMIZE`, `DESCRIBE HISTORY`) and database
//! DDL are recognized from the token stream and run against the catalog and
//! the delta layer. Everything else is planned by DataFusion.

use std::path::PathBuf;
use std::sync::Arc;

use datafusion::arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMillisecondArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::logical_expr::LogicalPlan;
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::tokenizer::{Token, Tokenizer};
use tracing::{debug, info};

use crate::dataframe::DataFrame;
use crate::delta::DeltaTable;
use crate::error::{LakebookError, Result};
use crate::session::Session;

/// Where a maintenance command applies.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Table(String),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Optimize(Target),
    DescribeHistory { target: Target, limit: Option<usize> },
    CreateDatabase { name: String, if_not_exists: bool },
    DropTable { name: String, if_exists: bool },
    DropView { name: String, if_exists: bool },
    Query,
}

pub(crate) async fn execute(session: &Session, query: &str) -> Result<DataFrame> {
    let command = parse_command(query)?;
    debug!("SQL command: {:?}", command);
    match command {
        Command::Optimize(target) => optimize(session, target).await,
        Command::DescribeHistory { target, limit } => describe_history(session, target, limit).await,
        Command::CreateDatabase {
            name,
            if_not_exists,
        } => {
            session.catalog().create_database(&name, if_not_exists)?;
            empty_result(session)
        }
        Command::DropTable { name, if_exists } => {
            if session.catalog().drop_temp_view(&name)? {
                return empty_result(session);
            }
            let (_, table) = session.catalog().resolve_name(&name)?;
            session.catalog().drop_table(&name, if_exists).await?;
            session.cache_manager().invalidate_table(&table).await;
            empty_result(session)
        }
        Command::DropView { name, if_exists } => {
            if !session.catalog().drop_temp_view(&name)? && !if_exists {
                return Err(LakebookError::TableNotFound(name));
            }
            empty_result(session)
        }
        Command::Query => {
            let df = session.ctx().sql(query).await?;
            if is_query(df.logical_plan()) {
                session.source(df)
            } else {
                Ok(DataFrame::new(session.clone(), df))
            }
        }
    }
}

fn is_query(plan: &LogicalPlan) -> bool {
    !matches!(
        plan,
        LogicalPlan::Explain(_)
            | LogicalPlan::Analyze(_)
            | LogicalPlan::Dml(_)
            | LogicalPlan::Ddl(_)
            | LogicalPlan::DescribeTable(_)
            | LogicalPlan::Statement(_)
            | LogicalPlan::Copy(_)
    )
}

fn empty_result(session: &Session) -> Result<DataFrame> {
    let df = session.ctx().read_empty()?;
    Ok(DataFrame::new(session.clone(), df))
}

/// Cursor over significant tokens.
struct Tokens {
    tokens: Vec<Token>,
    pos: usize,
}

impl Tokens {
    fn new(query: &str) -> Result<Self> {
        let tokens = Tokenizer::new(&GenericDialect {}, query)
            .tokenize()
            .map_err(|e| LakebookError::analysis(e.to_string()))?
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::SemiColon | Token::EOF))
            .collect();
        Ok(Self { tokens, pos: 0 })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
        matches!(token, Some(Token::Word(w)) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
    }

    /// Consume `keywords` if they come next, in order.
    fn accept(&mut self, keywords: &[&str]) -> bool {
        let matched = keywords
            .iter()
            .enumerate()
            .all(|(i, k)| Self::is_keyword(self.tokens.get(self.pos + i), k));
        if matched {
            self.pos += keywords.len();
        }
        matched
    }

    fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// A possibly qualified name: `a`, `a.b`, `` `a`.`b` ``.
    fn name(&mut self) -> Result<String> {
        let mut parts = Vec::new();
        loop {
            match self.next() {
                Some(Token::Word(w)) => parts.push(w.value),
                other => {
                    return Err(LakebookError::analysis(format!(
                        "expected a name, found {}",
                        other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".into())
                    )));
                }
            }
            if matches!(self.peek(), Some(Token::Period)) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(parts.join("."))
    }

    /// A table name, `delta.`/path``, or a quoted path.
    fn target(&mut self) -> Result<Target> {
        if let Some(Token::SingleQuotedString(path)) = self.peek() {
            let path = path.clone();
            self.pos += 1;
            return Ok(Target::Path(path));
        }
        let is_delta_path = Self::is_keyword(self.peek(), "delta")
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Period))
            && matches!(
                self.tokens.get(self.pos + 2),
                Some(Token::Word(w)) if w.quote_style == Some('`')
            );
        if is_delta_path {
            self.pos += 2;
            if let Some(Token::Word(w)) = self.next() {
                return Ok(Target::Path(w.value));
            }
        }
        Ok(Target::Table(self.name()?))
    }
}

fn parse_command(query: &str) -> Result<Command> {
    let mut tokens = Tokens::new(query)?;
    if tokens.accept(&["OPTIMIZE"]) {
        let target = tokens.target()?;
        if tokens.accept(&["ZORDER", "BY"]) {
            return Err(LakebookError::unsupported("OPTIMIZE with ZORDER BY"));
        }
        if !tokens.is_done() {
            return Err(LakebookError::unsupported(
                "OPTIMIZE with a WHERE clause or other options",
            ));
        }
        return Ok(Command::Optimize(target));
    }
    if tokens.accept(&["DESCRIBE", "HISTORY"]) || tokens.accept(&["DESC", "HISTORY"]) {
        let target = tokens.target()?;
        let limit = if tokens.accept(&["LIMIT"]) {
            match tokens.next() {
                Some(Token::Number(n, _)) => Some(n.parse::<usize>().map_err(|_| {
                    LakebookError::analysis(format!("invalid LIMIT '{n}'"))
                })?),
                _ => return Err(LakebookError::analysis("LIMIT expects a number")),
            }
        } else {
            None
        };
        return Ok(Command::DescribeHistory { target, limit });
    }
    if tokens.accept(&["CREATE", "DATABASE"]) || tokens.accept(&["CREATE", "SCHEMA"]) {
        let if_not_exists = tokens.accept(&["IF", "NOT", "EXISTS"]);
        let name = tokens.name()?;
        return Ok(Command::CreateDatabase {
            name,
            if_not_exists,
        });
    }
    if tokens.accept(&["DROP", "TABLE"]) {
        let if_exists = tokens.accept(&["IF", "EXISTS"]);
        let name = tokens.name()?;
        return Ok(Command::DropTable { name, if_exists });
    }
    if tokens.accept(&["DROP", "VIEW"]) {
        let if_exists = tokens.accept(&["IF", "EXISTS"]);
        let name = tokens.name()?;
        return Ok(Command::DropView { name, if_exists });
    }
    Ok(Command::Query)
}

async fn delta_location(session: &Session, target: &Target) -> Result<PathBuf> {
    let location = match target {
        Target::Table(name) => {
            let location = session.catalog().table_location(name)?;
            if !tokio::fs::try_exists(&location).await? {
                return Err(LakebookError::TableNotFound(name.clone()));
            }
            location
        }
        Target::Path(path) => session.resolve_path(path)?,
    };
    if !DeltaTable::is_delta_table(&location).await {
        return Err(LakebookError::analysis(format!(
            "{} is not a delta table",
            location.display()
        )));
    }
    Ok(location)
}

async fn optimize(session: &Session, target: Target) -> Result<DataFrame> {
    let location = delta_location(session, &target).await?;
    let max_file_size = session.conf().optimize_max_file_size()?;
    let metrics = DeltaTable::new(&location)?.optimize(max_file_size).await?;
    if let Target::Table(name) = &target {
        let (_, table) = session.catalog().resolve_name(name)?;
        session.cache_manager().invalidate_table(&table).await;
    }
    info!("OPTIMIZE {:?}: {:?}", target, metrics);

    let schema = Arc::new(Schema::new(vec![
        Field::new("path", DataType::Utf8, false),
        Field::new("numFilesAdded", DataType::Int64, false),
        Field::new("numFilesRemoved", DataType::Int64, false),
        Field::new("numBatches", DataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![location.display().to_string()])),
        Arc::new(Int64Array::from(vec![metrics.num_files_added as i64])),
        Arc::new(Int64Array::from(vec![metrics.num_files_removed as i64])),
        Arc::new(Int64Array::from(vec![metrics.num_batches as i64])),
    ];
    session.create_dataframe_from_batch(RecordBatch::try_new(schema, columns)?)
}

async fn describe_history(
    session: &Session,
    target: Target,
    limit: Option<usize>,
) -> Result<DataFrame> {
    let location = delta_location(session, &target).await?;
    let history = DeltaTable::new(&location)?.history(limit).await?;

    let schema = Arc::new(Schema::new(vec![
        Field::new("version", DataType::Int64, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            true,
        ),
        Field::new("operation", DataType::Utf8, true),
        Field::new("operationParameters", DataType::Utf8, true),
    ]));
    let parameters = history
        .iter()
        .map(|h| {
            let sorted: std::collections::BTreeMap<_, _> =
                h.commit_info.operation_parameters.iter().collect();
            serde_json::to_string(&sorted).map(Some)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            history.iter().map(|h| h.version).collect::<Vec<_>>(),
        )),
        Arc::new(TimestampMillisecondArray::from(
            history
                .iter()
                .map(|h| h.commit_info.timestamp)
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            history
                .iter()
                .map(|h| h.commit_info.operation.clone())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(parameters)),
    ];
    session.create_dataframe_from_batch(RecordBatch::try_new(schema, columns)?)
}
