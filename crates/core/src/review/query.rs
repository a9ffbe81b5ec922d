//! Building and parsing review queries.
//!
//! Topics are free text, so a topic typed by a human may contain characters
//! that are special to the query language. Every topic lookup goes through
//! [`topic_query`], which picks a quoting form the server accepts:
//!
//! * `topic:"..."` when the topic has no quote or backslash,
//! * `topic:{...}` when it has a quote but no braces,
//! * `topic:"..."` with `\"` and `\\` escapes otherwise.

/// Query matching changes whose topic equals `topic` exactly.
pub fn topic_query(topic: &str) -> String {
    if !topic.contains(['"', '\\']) {
        format!("topic:\"{topic}\"")
    } else if !topic.contains(['{', '}']) {
        format!("topic:{{{topic}}}")
    } else {
        let escaped = topic.replace('\\', "\\\\").replace('"', "\\\"");
        format!("topic:\"{escaped}\"")
    }
}

/// One `operator:value` term of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTerm {
    Topic(String),
    Project(String),
    Branch(String),
    Status(String),
    Other { operator: String, value: String },
}

/// Split a conjunctive query into terms.
///
/// Values may be bare, `"quoted"` with backslash escapes, or `{braced}`.
/// Returns `None` for syntax errors such as an unterminated quote.
pub fn parse_query(query: &str) -> Option<Vec<QueryTerm>> {
    let mut terms = Vec::new();
    let mut chars = query.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut operator = String::new();
        while let Some(c) = chars.next_if(|c| *c != ':' && !c.is_whitespace()) {
            operator.push(c);
        }
        chars.next_if_eq(&':')?;

        let value = match chars.peek() {
            Some('"') => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next()? {
                        '\\' => value.push(chars.next()?),
                        '"' => break,
                        c => value.push(c),
                    }
                }
                value
            }
            Some('{') => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        c => value.push(c),
                    }
                }
                value
            }
            _ => {
                let mut value = String::new();
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
                value
            }
        };

        terms.push(match operator.as_str() {
            "topic" => QueryTerm::Topic(value),
            "project" => QueryTerm::Project(value),
            "branch" => QueryTerm::Branch(value),
            "status" => QueryTerm::Status(value),
            _ => QueryTerm::Other { operator, value },
        });
    }

    Some(terms)
}

/// The topic a query filters on, if it has exactly one topic term.
pub fn parse_topic_query(query: &str) -> Option<String> {
    let mut topics = parse_query(query)?
        .into_iter()
        .filter_map(|t| match t {
            QueryTerm::Topic(topic) => Some(topic),
            _ => None,
        });
    let topic = topics.next()?;
    topics.next().is_none().then_some(topic)
}
