//! 内容记录的表驱动校验、文件名与图片格式检查。

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::storage::Resource;

const MAX_SLUG_LENGTH: usize = 100;

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("slug regex"));
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+_[0-9]+(?:_[a-z0-9]+)?$").expect("id regex"));
static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-]+\.[a-zA-Z0-9]+$").expect("filename regex"));

const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".py", ".sh", ".exe", ".bat", ".cmd", ".php", ".js", ".html", ".jsp", ".aspx", ".asp",
    ".cgi", ".pl", ".phtml", ".phar", ".htaccess", ".htpasswd", ".config", ".ini", ".env",
    ".rb", ".erb", ".lua", ".ps1", ".vbs", ".wsf",
];

const HTML_MARKERS: &[&str] = &["<", ">", "&lt;", "&gt;", "javascript:", "data:", "vbscript:"];

/// (pattern, replacement) pairs applied in order by [`sanitize_html`].
static SANITIZERS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?is)<script[^>]*>.*?</script>", ""),
        (r"(?is)<style[^>]*>.*?</style>", ""),
        (r"(?is)<iframe[^>]*>.*?</iframe>", ""),
        (r"(?is)<object[^>]*>.*?</object>", ""),
        (r"(?i)<embed[^>]*/?>", ""),
        (r"(?is)<svg[^>]*>.*?</svg>", ""),
        (r"(?is)<math[^>]*>.*?</math>", ""),
        (r"(?i)<base[^>]*/?>", ""),
        (r#"(?i)\s+on\w+\s*=\s*["'][^"']*["']"#, ""),
        (r"(?i)\s+on\w+\s*=\s*\S+", ""),
        (r#"(?i)(href|src)\s*=\s*["']?\s*javascript:[^"'>\s]*"#, r#"${1}="""#),
        (r#"(?i)(href|src)\s*=\s*["']?\s*data:[^"'>\s]*"#, r#"${1}="""#),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("sanitizer regex"), replacement))
    .collect()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    String,
    Number,
}

/// Record identifier families; each except `Service` carries a `<name>_` prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdType {
    Master,
    Article,
    Product,
    Category,
    Faq,
    /// Integer, either a JSON number or a numeric string.
    Service,
}

impl IdType {
    fn prefix(self) -> &'static str {
        match self {
            IdType::Master => "master_",
            IdType::Article => "article_",
            IdType::Product => "product_",
            IdType::Category => "category_",
            IdType::Faq => "faq_",
            IdType::Service => "",
        }
    }
}

/// Constraints for one field. Everything except `required` is skipped for
/// empty values (`null`, `false`, `0`, `""`, `[]`, `{}`).
#[derive(Clone, Copy, Debug)]
pub struct Rule {
    pub required: bool,
    pub kind: Option<Kind>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: &'static [&'static str],
    pub no_html: bool,
    pub sanitize: bool,
    pub id_type: Option<IdType>,
    pub slug: bool,
}

impl Rule {
    const fn new() -> Self {
        Self {
            required: false,
            kind: None,
            max_length: None,
            min: None,
            max: None,
            allowed: &[],
            no_html: false,
            sanitize: false,
            id_type: None,
            slug: false,
        }
    }

    const fn id(id_type: IdType) -> Self {
        Self {
            id_type: Some(id_type),
            ..Self::new()
        }
    }

    const fn required_text(max_length: usize) -> Self {
        Self {
            required: true,
            kind: Some(Kind::String),
            max_length: Some(max_length),
            no_html: true,
            ..Self::new()
        }
    }

    const fn price(max: f64) -> Self {
        Self {
            kind: Some(Kind::Number),
            min: Some(0.0),
            max: Some(max),
            ..Self::new()
        }
    }
}

pub type Schema = &'static [(&'static str, Rule)];

pub const MASTER_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Master)),
    ("name", Rule::required_text(100)),
    (
        "badge",
        Rule {
            allowed: &["green", "pink", "blue"],
            ..Rule::new()
        },
    ),
];

pub const SERVICE_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Service)),
    (
        "name",
        Rule {
            required: true,
            kind: Some(Kind::String),
            max_length: Some(200),
            ..Rule::new()
        },
    ),
    ("priceGreen", Rule::price(1_000_000.0)),
    ("pricePink", Rule::price(1_000_000.0)),
    ("priceBlue", Rule::price(1_000_000.0)),
    ("price", Rule::price(1_000_000.0)),
];

pub const ARTICLE_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Article)),
    ("title", Rule::required_text(500)),
    (
        "content",
        Rule {
            kind: Some(Kind::String),
            max_length: Some(100_000),
            sanitize: true,
            ..Rule::new()
        },
    ),
    (
        "excerpt",
        Rule {
            kind: Some(Kind::String),
            sanitize: true,
            ..Rule::new()
        },
    ),
];

pub const FAQ_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Faq)),
    ("question", Rule::required_text(500)),
    (
        "answer",
        Rule {
            kind: Some(Kind::String),
            max_length: Some(10_000),
            no_html: true,
            ..Rule::new()
        },
    ),
];

pub const PRODUCT_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Product)),
    ("name", Rule::required_text(200)),
    (
        "status",
        Rule {
            allowed: &["active", "inactive", "draft"],
            ..Rule::new()
        },
    ),
    ("price", Rule::price(10_000_000.0)),
    ("categoryId", Rule::id(IdType::Category)),
    (
        "description",
        Rule {
            kind: Some(Kind::String),
            max_length: Some(10_000),
            sanitize: true,
            ..Rule::new()
        },
    ),
];

pub const CATEGORY_SCHEMA: Schema = &[
    ("id", Rule::id(IdType::Category)),
    ("name", Rule::required_text(100)),
    (
        "slug",
        Rule {
            slug: true,
            ..Rule::new()
        },
    ),
];

/// 按 schema 校验一条记录；`sanitize` 字段会被原地替换为清洗后的值。
pub fn validate(record: &mut Map<String, Value>, schema: &[(&str, Rule)]) -> Result<(), String> {
    for (field, rule) in schema {
        let value = record.get(*field).cloned().unwrap_or(Value::Null);

        if is_empty(&value) {
            if rule.required {
                return Err(format!("Invalid or missing {field}"));
            }
            continue;
        }

        match (rule.kind, &value) {
            (Some(Kind::String), v) if !v.is_string() => {
                return Err(format!("Invalid {field} type"));
            }
            (Some(Kind::Number), v) if !v.is_number() => return Err(format!("Invalid {field}")),
            _ => {}
        }

        if let (Some(max_length), Value::String(text)) = (rule.max_length, &value)
            && text.chars().count() > max_length
        {
            return Err(format!("{} too long", capitalize(field)));
        }

        if let Some(number) = value.as_f64() {
            if !number.is_finite() {
                return Err(format!("Invalid {field} value"));
            }
            if rule.min.is_some_and(|min| number < min) || rule.max.is_some_and(|max| number > max)
            {
                return Err(format!("Invalid {field}"));
            }
        }

        if !rule.allowed.is_empty()
            && !value
                .as_str()
                .is_some_and(|text| rule.allowed.contains(&text))
        {
            return Err(format!(
                "Invalid {field}. Must be one of: {}",
                rule.allowed.join(", ")
            ));
        }

        if rule.no_html
            && let Value::String(text) = &value
            && contains_html(text)
        {
            return Err(format!("Invalid characters in {field}"));
        }

        if rule.sanitize
            && let Value::String(text) = &value
        {
            record.insert(field.to_string(), Value::String(sanitize_html(text)));
        }

        if let Some(id_type) = rule.id_type
            && !id_matches(&value, id_type)
        {
            return Err("Invalid ID format".into());
        }

        if rule.slug && !value.as_str().is_some_and(is_valid_slug) {
            return Err("Invalid slug format".into());
        }
    }
    Ok(())
}

/// 校验即将整体写入的文档中的各条记录。
pub fn validate_document(resource: Resource, document: &mut Value) -> Result<(), String> {
    match resource {
        Resource::Masters => validate_items(document.get_mut("masters"), MASTER_SCHEMA),
        Resource::Services => {
            if let Some(categories) = document.get_mut("categories").and_then(Value::as_array_mut)
            {
                for category in categories {
                    validate_items(category.get_mut("services"), SERVICE_SCHEMA)?;
                }
            }
            let podology = document
                .get_mut("podology")
                .and_then(|podology| podology.get_mut("services"));
            validate_items(podology, SERVICE_SCHEMA)
        }
        Resource::Articles => validate_items(document.get_mut("articles"), ARTICLE_SCHEMA),
        Resource::Faq => {
            validate_items(document.get_mut("faq"), FAQ_SCHEMA)?;
            validate_items(document.get_mut("items"), FAQ_SCHEMA)
        }
        Resource::ShopProducts => validate_items(document.get_mut("products"), PRODUCT_SCHEMA),
        Resource::ShopCategories => {
            validate_items(document.get_mut("categories"), CATEGORY_SCHEMA)
        }
        Resource::Legal | Resource::Social | Resource::Stats => Ok(()),
    }
}

/// Non-array collections and non-object items are left alone.
fn validate_items(items: Option<&mut Value>, schema: Schema) -> Result<(), String> {
    let Some(items) = items.and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for item in items {
        if let Value::Object(record) = item {
            validate(record, schema)?;
        }
    }
    Ok(())
}

/// Null, `false`, zero and empty strings, arrays or objects.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

fn capitalize(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

pub fn contains_html(text: &str) -> bool {
    let lower = text.to_lowercase();
    HTML_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn sanitize_html(text: &str) -> String {
    SANITIZERS
        .iter()
        .fold(text.to_string(), |acc, (pattern, replacement)| {
            pattern.replace_all(&acc, *replacement).into_owned()
        })
}

pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= MAX_SLUG_LENGTH && SLUG_RE.is_match(slug)
}

fn id_matches(value: &Value, id_type: IdType) -> bool {
    match value {
        Value::String(id) => is_valid_id(id, id_type),
        Value::Number(number) => id_type == IdType::Service && (number.is_i64() || number.is_u64()),
        _ => false,
    }
}

pub fn is_valid_id(id: &str, id_type: IdType) -> bool {
    if id.is_empty() {
        return false;
    }
    if id_type == IdType::Service {
        return id.trim().parse::<i64>().is_ok();
    }
    id.starts_with(id_type.prefix()) && ID_RE.is_match(id)
}

/// 上传文件名白名单：单个扩展名，且不是可执行/配置类扩展名。
pub fn is_valid_filename(name: &str) -> bool {
    if !FILENAME_RE.is_match(name) {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    !DANGEROUS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// 通过文件头识别图片格式，返回扩展名。
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("jpg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn required_field_missing_or_empty() {
        let mut record = object(json!({"badge": "green"}));
        assert_eq!(
            validate(&mut record, MASTER_SCHEMA),
            Err("Invalid or missing name".into())
        );
        let mut record = object(json!({"name": ""}));
        assert_eq!(
            validate(&mut record, MASTER_SCHEMA),
            Err("Invalid or missing name".into())
        );
    }

    #[test]
    fn master_rules() {
        let mut ok = object(json!({"id": "master_1700000000", "name": "Иван", "badge": "pink"}));
        assert_eq!(validate(&mut ok, MASTER_SCHEMA), Ok(()));

        let mut html = object(json!({"name": "<b>Ivan</b>"}));
        assert_eq!(
            validate(&mut html, MASTER_SCHEMA),
            Err("Invalid characters in name".into())
        );

        let mut badge = object(json!({"name": "Ivan", "badge": "gold"}));
        assert_eq!(
            validate(&mut badge, MASTER_SCHEMA),
            Err("Invalid badge. Must be one of: green, pink, blue".into())
        );

        let mut id = object(json!({"id": "article_1", "name": "Ivan"}));
        assert_eq!(validate(&mut id, MASTER_SCHEMA), Err("Invalid ID format".into()));
    }

    #[test]
    fn max_length_counts_characters() {
        let mut record = object(json!({"name": "я".repeat(100)}));
        assert_eq!(validate(&mut record, MASTER_SCHEMA), Ok(()));
        let mut record = object(json!({"name": "я".repeat(101)}));
        assert_eq!(
            validate(&mut record, MASTER_SCHEMA),
            Err("Name too long".into())
        );
    }

    #[test]
    fn numeric_ranges_and_types() {
        let mut record = object(json!({"name": "Fade", "price": 1500, "priceGreen": 0}));
        assert_eq!(validate(&mut record, SERVICE_SCHEMA), Ok(()));

        let mut negative = object(json!({"name": "Fade", "price": -1}));
        assert_eq!(
            validate(&mut negative, SERVICE_SCHEMA),
            Err("Invalid price".into())
        );
        let mut text = object(json!({"name": "Fade", "pricePink": "100"}));
        assert_eq!(
            validate(&mut text, SERVICE_SCHEMA),
            Err("Invalid pricePink".into())
        );
        let mut huge = object(json!({"name": "Oil", "price": 10_000_001}));
        assert_eq!(
            validate(&mut huge, PRODUCT_SCHEMA),
            Err("Invalid price".into())
        );
    }

    #[test]
    fn sanitize_rewrites_field_in_place() {
        let mut article = object(json!({
            "title": "Care",
            "content": "<p onclick=\"x()\">Hi</p><script>alert(1)</script><a href=\"javascript:evil()\">l</a>"
        }));
        assert_eq!(validate(&mut article, ARTICLE_SCHEMA), Ok(()));
        let content = article["content"].as_str().expect("content");
        assert!(!content.contains("script"));
        assert!(!content.contains("onclick"));
        assert!(!content.contains("javascript:"));
        assert!(content.contains("<p>Hi</p>"));
    }

    #[test]
    fn sanitize_strips_multiline_blocks() {
        let cleaned = sanitize_html("a<STYLE>\nbody{}\n</style>b<svg><g/></svg>c<embed src=x>");
        assert_eq!(cleaned, "abc");
    }

    #[test]
    fn category_slug_and_product_category_id() {
        let mut category = object(json!({"id": "category_1", "name": "Hair", "slug": "hair-care"}));
        assert_eq!(validate(&mut category, CATEGORY_SCHEMA), Ok(()));
        let mut bad = object(json!({"name": "Hair", "slug": "Hair Care"}));
        assert_eq!(
            validate(&mut bad, CATEGORY_SCHEMA),
            Err("Invalid slug format".into())
        );
        let mut product = object(json!({"name": "Oil", "categoryId": "product_1"}));
        assert_eq!(
            validate(&mut product, PRODUCT_SCHEMA),
            Err("Invalid ID format".into())
        );
    }

    #[test]
    fn document_validation_walks_nested_services() {
        let mut services = json!({
            "categories": [{"id": 1, "services": [{"name": "Fade", "price": 100}]}],
            "podology": {"services": [{"price": 10}]}
        });
        assert_eq!(
            validate_document(Resource::Services, &mut services),
            Err("Invalid or missing name".into())
        );

        let mut faq = json!({"items": [{"question": "<script>"}]});
        assert_eq!(
            validate_document(Resource::Faq, &mut faq),
            Err("Invalid characters in question".into())
        );

        let mut services = json!({"categories": [{"services": [
            {"id": 3, "name": "Fade"},
            {"id": "4", "name": "Shave"}
        ]}]});
        assert_eq!(validate_document(Resource::Services, &mut services), Ok(()));
        for bad_id in [json!("service_4"), json!(2.5), json!(["4"])] {
            let mut services = json!({"categories": [{"services": [{"id": bad_id, "name": "Fade"}]}]});
            assert_eq!(
                validate_document(Resource::Services, &mut services),
                Err("Invalid ID format".into())
            );
        }
        let mut master = json!({"masters": [{"id": 7, "name": "Ivan"}]});
        assert_eq!(
            validate_document(Resource::Masters, &mut master),
            Err("Invalid ID format".into())
        );

        let mut social = json!({"social": [{"url": "<x>"}]});
        assert_eq!(validate_document(Resource::Social, &mut social), Ok(()));
    }

    #[test]
    fn slugs_and_ids() {
        assert!(is_valid_slug("privacy-policy"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("-privacy"));
        assert!(!is_valid_slug("privacy--policy"));
        assert!(!is_valid_slug(&"a".repeat(101)));

        assert!(is_valid_id("faq_1700000000_ab12", IdType::Faq));
        assert!(!is_valid_id("faq_abc", IdType::Faq));
        assert!(is_valid_id("42", IdType::Service));
        assert!(!is_valid_id("x42", IdType::Service));
    }

    #[test]
    fn filenames() {
        assert!(is_valid_filename("0f3c2a9b.png"));
        assert!(is_valid_filename("photo_1-2.JPG"));
        assert!(!is_valid_filename("../etc/passwd"));
        assert!(!is_valid_filename("a.b.png"));
        assert!(!is_valid_filename("shell.php"));
        assert!(!is_valid_filename("page.HTML"));
        assert!(!is_valid_filename(".env"));
    }

    #[test]
    fn image_signatures() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&[0; 8]);
        assert_eq!(sniff_image(&png), Some("png"));
        assert_eq!(sniff_image(&[0xff, 0xd8, 0xff, 0xe0, 0, 0, 0, 0, 0, 0, 0, 0]), Some("jpg"));
        assert_eq!(sniff_image(b"GIF89a______"), Some("gif"));
        assert_eq!(sniff_image(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_image(b"\x89PNG\r\n\x1a\n"), None);
        assert_eq!(sniff_image(b"hello, world!"), None);
    }
}
