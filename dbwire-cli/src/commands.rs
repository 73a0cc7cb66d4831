//! Command execution.

use crate::Commands;
use colored::Colorize;
use dbwire_client::{
    BackoffPolicy, ClientError, Collection, DataModel, ResultStream, Row, Session, Statement,
    Value,
};
use serde_json::Value as JsonValue;

/// Executes a command and returns the formatted output.
pub async fn execute(
    session: &mut Session,
    cmd: Commands,
    policy: Option<&mut BackoffPolicy>,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let statement = match cmd {
        Commands::Ping => {
            session.ping().await?;
            return Ok("PONG".green().to_string());
        }

        // Handled in main.rs before connecting
        Commands::HashPassword { .. } => unreachable!(),

        Commands::Sql { query, binds } => {
            let mut statement = Statement::sql(query);
            for bind in &binds {
                statement = statement.bind(parse_value(bind))?;
            }
            statement
        }

        Commands::Find {
            collection,
            schema,
            document,
            criteria,
            fields,
            order,
            desc,
            limit,
            offset,
        } => {
            let mut target = Collection::new(collection);
            if let Some(schema) = schema {
                target = target.in_schema(schema);
            }
            let model = if document {
                DataModel::Document
            } else {
                DataModel::Table
            };

            let mut statement = Statement::find(target, model).with_projection(fields);
            if let Some(criteria) = criteria {
                statement = statement.with_criteria(criteria);
            }
            if let Some(order) = order {
                statement = statement.with_order(order, desc);
            }
            if let Some(limit) = limit {
                statement = statement.with_limit(limit, offset);
            }
            statement
        }
    };

    let mut stream = match policy {
        Some(policy) => session.execute_with_retry(&statement, policy).await?,
        None => session.execute(&statement).await?,
    };
    Ok(render(&mut stream, json).await?)
}

/// Renders every result set of a stream.
async fn render(stream: &mut ResultStream<'_>, json: bool) -> Result<String, ClientError> {
    let mut sections = Vec::new();

    loop {
        if !stream.columns().is_empty() {
            let names: Vec<String> = stream.columns().iter().map(|c| c.name.clone()).collect();
            let rows = stream.fetch_all().await?;
            sections.push(if json {
                format_json_lines(&rows)
            } else {
                format_table(&names, &rows)
            });
        }
        if !stream.next_result().await? {
            break;
        }
    }

    for notice in stream.warnings() {
        let code = notice.code.map(|c| format!(" {}", c)).unwrap_or_default();
        sections.push(format!("{}{}: {}", "Warning".yellow(), code, notice.message));
    }

    let mut summary = format!("{} row(s) affected", stream.rows_affected());
    if let Some(id) = stream.last_insert_id() {
        summary.push_str(&format!(", last insert id {}", id));
    }
    if !stream.generated_ids().is_empty() {
        summary.push_str(&format!(", generated ids {}", stream.generated_ids().join(", ")));
    }
    sections.push(summary.dimmed().to_string());

    Ok(sections.join("\n"))
}

/// Parses a bind argument: JSON when it parses, a plain string otherwise.
fn parse_value(arg: &str) -> Value {
    match serde_json::from_str::<JsonValue>(arg) {
        Ok(JsonValue::Null) => Value::Null,
        Ok(JsonValue::Bool(b)) => Value::from(b),
        Ok(JsonValue::Number(n)) => n
            .as_i64()
            .map(Value::from)
            .or_else(|| n.as_u64().map(Value::from))
            .or_else(|| n.as_f64().map(Value::from))
            .unwrap_or_else(|| Value::from(arg)),
        Ok(JsonValue::String(s)) => Value::from(s),
        Ok(json) => Value::from(json),
        Err(_) => Value::from(arg),
    }
}

fn format_json_lines(rows: &[Row]) -> String {
    rows.iter()
        .map(|row| row.to_json().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats rows as an aligned text table.
fn format_table(columns: &[String], rows: &[Row]) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.values().iter().map(format_cell).collect())
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let pad = |text: &str, width: usize| {
        let fill = width.saturating_sub(text.chars().count());
        format!("{}{}", text, " ".repeat(fill))
    };

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| pad(c, *w))
        .collect();
    let mut lines = vec![header.join("  ").bold().to_string()];
    for row in &cells {
        let line: Vec<String> = row.iter().zip(&widths).map(|(c, w)| pad(c, *w)).collect();
        lines.push(line.join("  ").trim_end().to_string());
    }
    lines.push(format!("({} row{})", rows.len(), if rows.len() == 1 { "" } else { "s" }));
    lines.join("\n")
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Sint(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Bytes(b) => format!("0x{}", hex::encode(b)),
        Value::Json(json) => json.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), Value::from(42i64));
        assert_eq!(parse_value("true"), Value::from(true));
        assert_eq!(parse_value("alice"), Value::from("alice"));
        assert_eq!(parse_value("\"7\""), Value::from("7"));
        assert_eq!(parse_value("null"), Value::Null);
        assert!(matches!(parse_value("{\"a\": 1}"), Value::Json(_)));
    }

    #[test]
    fn test_format_cell() {
        assert_eq!(format_cell(&Value::Null), "NULL");
        assert_eq!(format_cell(&Value::from("x")), "x");
        assert_eq!(format_cell(&Value::from(vec![0xdeu8, 0xad])), "0xdead");
        assert_eq!(format_cell(&Value::from(-3i64)), "-3");
    }
}
