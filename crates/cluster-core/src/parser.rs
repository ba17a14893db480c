//! Parsing of UCI engine output lines (`info ...` and `bestmove ...`).

use serde_json::{Map, Number, Value};

/// A JSON object of fields extracted from one `info` line.
pub type Fields = Map<String, Value>;

/// The result of parsing one line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// An `info ...` line, with the fields recognised on it.
    Info(Fields),
    /// A `bestmove ...` line, with the move token (may be `(none)`).
    BestMove(String),
    /// A line we don't care about (ignored for the update stream).
    Other,
}

/// Parse one line of UCI engine output.
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("info") {
        return ParsedLine::Info(parse_info_fields(rest));
    }
    if let Some(rest) = line.strip_prefix("bestmove") {
        return match rest.split_whitespace().next() {
            Some(mv) => ParsedLine::BestMove(mv.to_string()),
            None => ParsedLine::Other,
        };
    }
    ParsedLine::Other
}

fn parse_info_fields(rest: &str) -> Fields {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut fields = Fields::new();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "depth" | "seldepth" | "nodes" | "nps" | "multipv" => {
                let key = tokens[i];
                if let Some(value) = tokens.get(i + 1).and_then(|v| v.parse::<i64>().ok()) {
                    fields.insert(key.to_string(), Value::Number(Number::from(value)));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "score" => {
                match tokens.get(i + 1).copied() {
                    Some("cp") => {
                        if let Some(value) = tokens.get(i + 2).and_then(|v| v.parse::<i64>().ok())
                        {
                            fields.insert("score_cp".to_string(), Value::Number(Number::from(value)));
                            i += 3;
                        } else {
                            i += 2;
                        }
                    }
                    Some("mate") => {
                        if let Some(value) = tokens.get(i + 2).and_then(|v| v.parse::<i64>().ok())
                        {
                            fields
                                .insert("score_mate".to_string(), Value::Number(Number::from(value)));
                            i += 3;
                        } else {
                            i += 2;
                        }
                    }
                    _ => i += 1,
                }
            }
            "pv" => {
                let pv = tokens[i + 1..].join(" ");
                fields.insert("pv".to_string(), Value::String(pv));
                break;
            }
            _ => i += 1,
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_depth_and_score_cp() {
        let line = "info depth 12 seldepth 18 multipv 1 score cp 34 nodes 98765 nps 1200000 pv e2e4 e7e5";
        let ParsedLine::Info(fields) = parse_line(line) else {
            panic!("expected Info");
        };
        assert_eq!(fields["depth"], 12);
        assert_eq!(fields["seldepth"], 18);
        assert_eq!(fields["multipv"], 1);
        assert_eq!(fields["score_cp"], 34);
        assert_eq!(fields["nodes"], 98765);
        assert_eq!(fields["nps"], 1200000);
        assert_eq!(fields["pv"], "e2e4 e7e5");
    }

    #[test]
    fn parses_score_mate() {
        let ParsedLine::Info(fields) = parse_line("info depth 5 score mate 3 pv h1h8") else {
            panic!("expected Info");
        };
        assert_eq!(fields["score_mate"], 3);
        assert_eq!(fields["pv"], "h1h8");
    }

    #[test]
    fn multipv_defaults_absent_when_not_present() {
        let ParsedLine::Info(fields) = parse_line("info depth 1 nodes 10") else {
            panic!("expected Info");
        };
        assert!(!fields.contains_key("multipv"));
    }

    #[test]
    fn parses_bestmove() {
        assert_eq!(
            parse_line("bestmove e2e4 ponder e7e5"),
            ParsedLine::BestMove("e2e4".to_string())
        );
        assert_eq!(
            parse_line("bestmove (none)"),
            ParsedLine::BestMove("(none)".to_string())
        );
    }

    #[test]
    fn unrecognised_lines_are_other() {
        assert_eq!(parse_line("id name Stockfish 16"), ParsedLine::Other);
        assert_eq!(parse_line("uciok"), ParsedLine::Other);
    }
}
