use std::path::Path;

use anyhow::{Context, Result, bail};

const INTRO: &str = "You extract structured data from photographed receipts. Receipts come from many countries, in many languages and layouts.";
const FIELDS_HEADER: &str = "Extract these fields:";
const FIELDS: &[&str] = &[
    "receipt_number: the receipt's unique number, usually near the top.",
    "store_name: the store, cafe, restaurant or service provider.",
    "store_address: the address, including city and country when shown.",
    "date_time: the transaction date formatted as YYYY-MM-DD HH:MM.",
    "currency: only if printed (EUR, USD, ...), otherwise null.",
    "total_amount: the final amount paid, usually the largest figure at the bottom.",
    "total_discount: as printed, or the sum of the item discounts.",
    "total_tax: the total tax paid or payable.",
];
const ITEMS_HEADER: &str = "For every item extract:";
const ITEMS: &[&str] = &[
    "name: the full name. Names may span lines; join lines until a quantity or unit appears.",
    "quantity.amount and quantity.unit_of_measurement, the unit being one of pcs, kg, g, lb.",
    "price: the final price of the line.",
    "discount: the line discount, if any.",
];
const QUANTITY_RULES_HEADER: &str = "Quantities:";
const QUANTITY_RULES: &[&str] = &[
    "A number with a weight unit (kg, kgs, grams, lbs, pounds...) is a weight; normalize the unit to kg, g or lb.",
    "\"5 * 23.00 = 115.0\" means 5 pcs; the item name is on an adjacent line, above or below.",
    "Items sold by piece without a printed quantity default to 1 pcs.",
    "When the unit cannot be determined use \"not available\" and amount \"unknown\".",
];
const OUTPUT_FORMAT: &str = r#"Respond with this JSON object:
{"receipt_number": "string", "store_name": "string", "store_address": "string", "date_time": "string", "currency": "string or null", "total_amount": number, "total_discount": number, "total_tax": number, "items": [{"name": "string", "quantity": {"amount": number, "unit_of_measurement": "pcs|kg|g|lb"}, "price": number, "discount": number or null}]}"#;
const RULES_HEADER: &str = "Rules:";
const RULES: &[&str] = &[
    "Output JSON only. No markdown, no extra text.",
    "Use \"unknown\" or \"not available\" for anything unclear or missing.",
];

fn bullets(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| format!("- {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The built-in receipt extraction prompt.
pub fn build_receipt_prompt() -> String {
    format!(
        "{INTRO}\n\n{FIELDS_HEADER}\n{}\n\n{ITEMS_HEADER}\n{}\n\n{QUANTITY_RULES_HEADER}\n{}\n\n{OUTPUT_FORMAT}\n\n{RULES_HEADER}\n{}\n",
        bullets(FIELDS),
        bullets(ITEMS),
        bullets(QUANTITY_RULES),
        bullets(RULES),
    )
}

/// Load a prompt override from disk, or fall back to the built-in one.
pub fn load_prompt(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(build_receipt_prompt());
    };
    let prompt = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt file {}", path.display()))?;
    if prompt.trim().is_empty() {
        bail!("prompt file {} is empty", path.display());
    }
    Ok(prompt)
}
