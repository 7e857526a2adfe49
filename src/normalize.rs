//! # Normalizer
//! Pure, stateless parsers turning raw scraped strings into typed values:
//! price, mileage, year, department, power, phone, fuel/gearbox/seller
//! detection, and title → (make, model, version) inference.
//!
//! All regexes are compiled once. Every function returns "don't know"
//! (`None` / `Unknown`) rather than guessing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{fold_accents, norm_key, Fuel, Gearbox, SellerType};

static RE_PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d[\d\s\u{202f}\u{00a0}.,]*)\s*€").expect("price regex"));
static RE_KM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d[\d\s\u{202f}\u{00a0}.,]*)\s*km").expect("km regex"));
static RE_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})\b").expect("year regex"));
static RE_POSTAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{5})\b").expect("postal regex"));
static RE_DEPT_PAREN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{2}[AB]?)\)").expect("dept regex"));
static RE_POWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{2,3})\s*(?:ch|cv|hp)\b").expect("power regex"));
static RE_PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:0|\+33)[1-9](?:[\s.\-]?\d{2}){4}").expect("phone regex"));
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
static RE_MODEL_ENGINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\d+\.\d+\s*(hdi|dci|tdi|vti|tce|dti|cdti|jtd).*").expect("model engine regex")
});
static RE_MODEL_POWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d+\s*(ch|cv).*").expect("model power regex"));
static RE_MOTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d+\.\d+)\s*(hdi|dci|tdi|vti|tce|dti|cdti|jtd|d-4d|bluehdi|blue\s*hdi)|(\d+\.\d+)\s*(l|litres?)\b|(\d{2,3})\s*(ch|cv|hp)\b",
    )
    .expect("motorisation regex")
});

const PRICE_MIN: u32 = 100;
const PRICE_MAX: u32 = 100_000;
/// Bare digit groups (no currency symbol) are accepted only above this —
/// lower values are more often deposits or monthly rates.
const PRICE_BARE_MIN: u32 = 500;
const KM_MIN: u32 = 100;
const KM_MAX: u32 = 500_000;
const YEAR_MIN: i32 = 1980;
const POWER_MIN: u32 = 40;
const POWER_MAX: u32 = 500;

/// Extract a price in euros. Handles `2 500 €`, `2.500€`, NBSP/thin-space
/// grouping, and bare digit groups without the symbol.
pub fn parse_price(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }
    if let Some(caps) = RE_PRICE.captures(text) {
        let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
        let price: u32 = digits.parse().ok()?;
        return (PRICE_MIN..=PRICE_MAX).contains(&price).then_some(price);
    }
    // No currency symbol: accept the digits only if they look like a price.
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let price: u32 = digits.parse().ok()?;
    (PRICE_BARE_MIN..=PRICE_MAX).contains(&price).then_some(price)
}

/// Extract a mileage: first numeric group followed by `km`.
pub fn parse_km(text: &str) -> Option<u32> {
    let caps = RE_KM.captures(text)?;
    let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
    let km: u32 = digits.parse().ok()?;
    (KM_MIN..=KM_MAX).contains(&km).then_some(km)
}

/// Extract a model year: the most recent four-digit number in
/// `[1980, current_year + 1]`.
pub fn parse_year(text: &str) -> Option<i32> {
    let max_year = chrono::Utc::now().format("%Y").to_string().parse::<i32>().ok()? + 1;
    RE_YEAR
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<i32>().ok())
        .filter(|y| (YEAR_MIN..=max_year).contains(y))
        .max()
}

/// Extract a French department code from a postal code or a `(NN)` group.
/// Corsican postal codes map to `2A` / `2B`.
pub fn parse_department(text: &str) -> Option<String> {
    if let Some(caps) = RE_POSTAL.captures(text) {
        let postal = &caps[1];
        if let Some(corse) = corsica_department(postal) {
            return Some(corse.to_string());
        }
        return Some(postal[..2].to_string());
    }
    RE_DEPT_PAREN
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Extract a full 5-digit postal code.
pub fn parse_postal_code(text: &str) -> Option<String> {
    RE_POSTAL.captures(text).map(|caps| caps[1].to_string())
}

/// Corse-du-Sud (20000–20199) is 2A, Haute-Corse (20200+) is 2B.
fn corsica_department(postal: &str) -> Option<&'static str> {
    if !postal.starts_with("20") {
        return None;
    }
    match postal.as_bytes().get(2) {
        Some(b'0') | Some(b'1') => Some("2A"),
        Some(_) => Some("2B"),
        None => None,
    }
}

/// Detect fuel type from free text (engine codes count as evidence).
pub fn parse_fuel(text: &str) -> Fuel {
    let t = text.to_lowercase();
    const DIESEL: [&str; 9] = [
        "diesel", "gazole", "hdi", "dci", "tdi", "cdti", "jtd", "d-4d", "dti",
    ];
    const ESSENCE: [&str; 7] = ["essence", "sp95", "sp98", "sans plomb", "vti", "tce", "tfsi"];
    const HYBRID: [&str; 2] = ["hybride", "hybrid"];
    const ELECTRIC: [&str; 3] = ["électrique", "electrique", "electric"];
    const LPG: [&str; 2] = ["gpl", "lpg"];

    if DIESEL.iter().any(|p| t.contains(p)) {
        Fuel::Diesel
    } else if ESSENCE.iter().any(|p| t.contains(p)) {
        Fuel::Essence
    } else if HYBRID.iter().any(|p| t.contains(p)) {
        Fuel::Hybrid
    } else if ELECTRIC.iter().any(|p| t.contains(p)) {
        Fuel::Electric
    } else if LPG.iter().any(|p| t.contains(p)) {
        Fuel::Lpg
    } else {
        Fuel::Unknown
    }
}

/// Detect gearbox type from free text.
pub fn parse_gearbox(text: &str) -> Gearbox {
    let t = text.to_lowercase();
    if ["manuel", "manuelle", "mécanique", "mecanique"]
        .iter()
        .any(|p| t.contains(p))
    {
        Gearbox::Manual
    } else if ["auto", "automatique", "bva", "dsg", "dct"]
        .iter()
        .any(|p| t.contains(p))
    {
        Gearbox::Automatic
    } else {
        Gearbox::Unknown
    }
}

/// Detect seller type from free text (pro wording wins over private).
pub fn parse_seller_type(text: &str) -> SellerType {
    let t = text.to_lowercase();
    const PRO: [&str; 10] = [
        "professionnel",
        "pro",
        "garage",
        "concessionnaire",
        "marchand",
        "négociant",
        "société",
        "sarl",
        "sas",
        "eurl",
    ];
    const PARTICULIER: [&str; 4] = ["particulier", "privé", "private", "owner"];

    if PRO.iter().any(|p| t.contains(p)) {
        SellerType::Professionnel
    } else if PARTICULIER.iter().any(|p| t.contains(p)) {
        SellerType::Particulier
    } else {
        SellerType::Unknown
    }
}

/// Extract engine power in hp, valid 40..=500.
pub fn parse_power(text: &str) -> Option<u32> {
    let caps = RE_POWER.captures(text)?;
    let power: u32 = caps[1].parse().ok()?;
    (POWER_MIN..=POWER_MAX).contains(&power).then_some(power)
}

/// Extract a French phone number, separators stripped.
pub fn extract_phone(text: &str) -> Option<String> {
    RE_PHONE.find(text).map(|m| {
        m.as_str()
            .chars()
            .filter(|c| !matches!(c, ' ' | '.' | '-'))
            .collect()
    })
}

/// Extract an engine label like `1.4 HDi`, `1.6 l`, or `90 ch`.
pub fn extract_motorisation(text: &str) -> String {
    RE_MOTOR
        .find(text)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Known makes, checked by substring in titles.
const KNOWN_MAKES: [&str; 19] = [
    "Peugeot",
    "Renault",
    "Citroën",
    "Citroen",
    "Dacia",
    "Ford",
    "Volkswagen",
    "VW",
    "Toyota",
    "Opel",
    "Fiat",
    "Nissan",
    "Hyundai",
    "Kia",
    "Seat",
    "Skoda",
    "BMW",
    "Mercedes",
    "Audi",
];

/// Closed model → make mapping for titles that start with the model.
const MODEL_TO_MAKE: [(&str, &str); 54] = [
    ("106", "Peugeot"),
    ("107", "Peugeot"),
    ("108", "Peugeot"),
    ("206", "Peugeot"),
    ("207", "Peugeot"),
    ("208", "Peugeot"),
    ("306", "Peugeot"),
    ("307", "Peugeot"),
    ("308", "Peugeot"),
    ("406", "Peugeot"),
    ("407", "Peugeot"),
    ("2008", "Peugeot"),
    ("3008", "Peugeot"),
    ("Partner", "Peugeot"),
    ("Clio", "Renault"),
    ("Megane", "Renault"),
    ("Twingo", "Renault"),
    ("Scenic", "Renault"),
    ("Captur", "Renault"),
    ("Laguna", "Renault"),
    ("Kangoo", "Renault"),
    ("C1", "Citroën"),
    ("C2", "Citroën"),
    ("C3", "Citroën"),
    ("C4", "Citroën"),
    ("C5", "Citroën"),
    ("Berlingo", "Citroën"),
    ("Picasso", "Citroën"),
    ("Saxo", "Citroën"),
    ("Sandero", "Dacia"),
    ("Logan", "Dacia"),
    ("Duster", "Dacia"),
    ("Dokker", "Dacia"),
    ("Fiesta", "Ford"),
    ("Focus", "Ford"),
    ("Ka", "Ford"),
    ("Mondeo", "Ford"),
    ("Kuga", "Ford"),
    ("Polo", "Volkswagen"),
    ("Golf", "Volkswagen"),
    ("Passat", "Volkswagen"),
    ("Touran", "Volkswagen"),
    ("Caddy", "Volkswagen"),
    ("Yaris", "Toyota"),
    ("Aygo", "Toyota"),
    ("Corolla", "Toyota"),
    ("Auris", "Toyota"),
    ("Corsa", "Opel"),
    ("Astra", "Opel"),
    ("Meriva", "Opel"),
    ("Zafira", "Opel"),
    ("Punto", "Fiat"),
    ("Panda", "Fiat"),
    ("500", "Fiat"),
];

/// Parse a listing title into `(make, model, version)`.
///
/// Recognises explicitly mentioned makes first, then known models; when a
/// known model appears without its make (`207 1.4 HDi 70ch`), the make is
/// inferred from the closed mapping.
pub fn parse_title(title: &str) -> (String, String, String) {
    let title = title.trim();
    if title.is_empty() {
        return (String::new(), String::new(), String::new());
    }

    let mut make = String::new();
    let mut version = title.to_string();

    let title_lower = title.to_lowercase();
    for m in KNOWN_MAKES {
        if title_lower.contains(&m.to_lowercase()) {
            make = m.to_string();
            if let Ok(re) = Regex::new(&format!(r"(?i){}", regex::escape(m))) {
                version = re.replace(&version, "").trim().to_string();
            }
            break;
        }
    }

    let words: Vec<String> = version.split_whitespace().map(str::to_string).collect();
    let mut model = String::new();

    for word in words.iter().take(3) {
        let word_clean: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if let Some((canonical, _)) = MODEL_TO_MAKE
            .iter()
            .find(|(m, _)| word_clean.eq_ignore_ascii_case(m))
        {
            model = canonical.to_string();
            version = words
                .iter()
                .filter(|w| *w != word)
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            break;
        }
    }

    if model.is_empty() {
        if let Some((first, rest)) = words.split_first() {
            model = first.clone();
            version = rest.join(" ");
        }
    }

    if make.is_empty() && !model.is_empty() {
        if let Some((_, inferred)) = MODEL_TO_MAKE
            .iter()
            .find(|(m, _)| model.eq_ignore_ascii_case(m))
        {
            make = inferred.to_string();
        }
    }

    (
        normalize_make(&make),
        normalize_model(&model),
        version.trim().to_string(),
    )
}

/// Normalise a make name: title case + common spelling corrections.
pub fn normalize_make(make: &str) -> String {
    if make.trim().is_empty() {
        return String::new();
    }
    let titled = title_case(make.trim());

    const CORRECTIONS: [(&str, &[&str]); 4] = [
        ("Volkswagen", &["vw", "volks"]),
        ("Mercedes-Benz", &["mercedes", "mb"]),
        ("Alfa Romeo", &["alfa"]),
        ("Citroën", &["citroen"]),
    ];
    let key = norm_key(&titled);
    for (correct, variants) in CORRECTIONS {
        if variants.iter().any(|v| norm_key(v) == key) {
            return correct.to_string();
        }
    }
    titled
}

/// Normalise a model name: strip engine/power suffixes, title case.
pub fn normalize_model(model: &str) -> String {
    if model.trim().is_empty() {
        return String::new();
    }
    let stripped = RE_MODEL_ENGINE.replace(model.trim(), "");
    let stripped = RE_MODEL_POWER.replace(&stripped, "");
    title_case(stripped.trim())
}

/// Clean scraped free text: decode HTML entities, strip tags, collapse
/// whitespace.
pub fn clean_text(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw).to_string();
    let no_tags = RE_TAGS.replace_all(&decoded, " ");
    RE_WS.replace_all(&no_tags, " ").trim().to_string()
}

/// Lowercased, accent-free copy (used for light token checks).
pub fn fold_lower(text: &str) -> String {
    fold_accents(&text.to_lowercase())
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_edge_cases() {
        assert_eq!(parse_price("2 500 €"), Some(2500));
        assert_eq!(parse_price("2.500€"), Some(2500));
        assert_eq!(parse_price("2\u{00a0}500\u{00a0}€"), Some(2500));
        assert_eq!(parse_price("Prix: 3 200 € négociable"), Some(3200));
        assert_eq!(parse_price("gratuit"), None);
        assert_eq!(parse_price("50 €"), None);
        assert_eq!(parse_price("150 000 €"), None);
    }

    #[test]
    fn price_without_symbol() {
        assert_eq!(parse_price("2500"), Some(2500));
        assert_eq!(parse_price("350"), None); // below the bare-number floor
    }

    #[test]
    fn km_parsing() {
        assert_eq!(parse_km("150 000 km"), Some(150_000));
        assert_eq!(parse_km("150000KM"), Some(150_000));
        assert_eq!(parse_km("150.000 km"), Some(150_000));
        assert_eq!(parse_km("9 km"), None); // below floor
        assert_eq!(parse_km("no mileage"), None);
    }

    #[test]
    fn year_takes_most_recent_in_range() {
        assert_eq!(parse_year("Clio de 2008, CT 2024"), Some(2024));
        assert_eq!(parse_year("mise en circulation 1995"), Some(1995));
        assert_eq!(parse_year("1887 pieces"), None);
        assert_eq!(parse_year("pas d'annee"), None);
    }

    #[test]
    fn department_from_postal_and_parens() {
        assert_eq!(parse_department("44300 Nantes").as_deref(), Some("44"));
        assert_eq!(parse_department("Rennes (35)").as_deref(), Some("35"));
        assert_eq!(parse_department("Ajaccio 20000").as_deref(), Some("2A"));
        assert_eq!(parse_department("Bastia 20200").as_deref(), Some("2B"));
        assert_eq!(parse_department("nulle part"), None);
    }

    #[test]
    fn fuel_detection_from_engine_codes() {
        assert_eq!(parse_fuel("1.4 HDi 70ch"), Fuel::Diesel);
        assert_eq!(parse_fuel("1.2 VTi"), Fuel::Essence);
        assert_eq!(parse_fuel("full hybrid"), Fuel::Hybrid);
        assert_eq!(parse_fuel("aucune info"), Fuel::Unknown);
    }

    #[test]
    fn title_inference_examples() {
        assert_eq!(
            parse_title("207 1.4 HDi 70ch"),
            (
                "Peugeot".to_string(),
                "207".to_string(),
                "1.4 HDi 70ch".to_string()
            )
        );
        assert_eq!(
            parse_title("Clio 3 1.5 dCi 85ch"),
            (
                "Renault".to_string(),
                "Clio".to_string(),
                "3 1.5 dCi 85ch".to_string()
            )
        );
        assert_eq!(
            parse_title("C3 1.4 HDi 70"),
            (
                "Citroën".to_string(),
                "C3".to_string(),
                "1.4 HDi 70".to_string()
            )
        );
    }

    #[test]
    fn title_with_explicit_make() {
        let (make, model, version) = parse_title("Peugeot 207 1.4 HDi");
        assert_eq!(make, "Peugeot");
        assert_eq!(model, "207");
        assert_eq!(version, "1.4 HDi");
    }

    #[test]
    fn make_corrections() {
        assert_eq!(normalize_make("vw"), "Volkswagen");
        assert_eq!(normalize_make("citroen"), "Citroën");
        assert_eq!(normalize_make("peugeot"), "Peugeot");
    }

    #[test]
    fn power_and_phone() {
        assert_eq!(parse_power("70 ch"), Some(70));
        assert_eq!(parse_power("700 ch"), None);
        assert_eq!(
            extract_phone("appeler le 06 12 34 56 78").as_deref(),
            Some("0612345678")
        );
        assert_eq!(extract_phone("pas de telephone"), None);
    }

    #[test]
    fn clean_text_strips_html() {
        let raw = "  <p>Tr&egrave;s  bon \u{e9}tat</p>  ";
        assert_eq!(clean_text(raw), "Très bon état");
    }
}
