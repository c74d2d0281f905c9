// 🧬 Derived-Entity Synthesizer
// Households and billing artifacts mined from the free-text legacy fields
// on student records.

use crate::entities::{BillingArtifact, Contact, FamilyGroup, Invoice, Payment, PaymentPurpose, Student};
use crate::mapper::{parse_date, parse_decimal, Warning};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Note stored on invoices whose amount came from the school
pub const DEFAULT_PRICE_NOTE: &str = "amount taken from school default price (no charge on record)";

// ============================================================================
// RECEIPT SEQUENCE
// ============================================================================

/// Receipt numbers `YYYYMMDD-NNNN`, unique within one synthesizer instance
#[derive(Debug, Default)]
pub struct ReceiptSequence {
    issued: u32,
}

impl ReceiptSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, date: NaiveDate) -> String {
        self.issued += 1;
        format!("{}-{:04}", date.format("%Y%m%d"), self.issued)
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }
}

// ============================================================================
// AMOUNT PARSING
// ============================================================================

const CURRENCY_MARKERS: [&str; 8] = ["CAD", "USD", "EUR", "$", "€", "£", "¥", "¢"];

/// Strip currency symbols/codes and separators, then parse
///
/// "$1,250.00", "1 250,00 $" and "CAD 45" all parse.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut cleaned = raw.trim().to_string();
    for marker in CURRENCY_MARKERS {
        cleaned = cleaned.replace(marker, "");
    }
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    parse_decimal(cleaned)
}

// ============================================================================
// SYNTHESIZER
// ============================================================================

pub struct Synthesizer {
    receipts: ReceiptSequence,
    run_date: NaiveDate,
}

impl Synthesizer {
    /// `run_date` stands in for payments with no recorded date
    pub fn new(run_date: NaiveDate) -> Self {
        Synthesizer {
            receipts: ReceiptSequence::new(),
            run_date,
        }
    }

    pub fn receipts_issued(&self) -> u32 {
        self.receipts.issued()
    }

    /// One group per distinct family string (exact equality), in order of
    /// first appearance
    pub fn families(&self, students: &[Student]) -> Vec<FamilyGroup> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<FamilyGroup> = Vec::new();

        for student in students {
            let Some(key) = student.legacy.family.as_deref() else {
                continue;
            };
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(FamilyGroup::new(key));
                groups.len() - 1
            });
            groups[slot].members.push(student.clone());
        }

        for group in &mut groups {
            group.contact = pick_contact(&group.members);
        }
        groups
    }

    /// Invoice, deposit and uniform payments for one student
    pub fn billing(&mut self, student: &Student, default_price: Option<f64>) -> (BillingArtifact, Vec<Warning>) {
        let legacy = &student.legacy;
        let mut warnings = Vec::new();
        let mut artifact = BillingArtifact::default();

        artifact.invoice = self.invoice(student, default_price, &mut warnings);

        if let Some(mut deposit) = self.payment(
            student,
            PaymentPurpose::Deposit,
            legacy.deposit.as_deref(),
            legacy.deposit_date.as_deref(),
            ("Deposit", "Deposit Date"),
            &mut warnings,
        ) {
            if deposit.invoice_key.is_none() {
                deposit.invoice_key = artifact.invoice.as_ref().map(|i| i.legacy_key.clone());
            }
            artifact.payment = Some(deposit);
        }

        let slots = [
            (PaymentPurpose::Uniform, &legacy.uniform, ("Uniform Amount", "Uniform Date")),
            (PaymentPurpose::UniformSecond, &legacy.uniform_2, ("Uniform 2 Amount", "Uniform 2 Date")),
        ];
        for (purpose, (date, amount), fields) in slots {
            if let Some(payment) =
                self.payment(student, purpose, amount.as_deref(), date.as_deref(), fields, &mut warnings)
            {
                artifact.ancillary_payments.push(payment);
            }
        }

        (artifact, warnings)
    }

    fn invoice(&self, student: &Student, default_price: Option<f64>, warnings: &mut Vec<Warning>) -> Option<Invoice> {
        let legacy = &student.legacy;
        let charge = match legacy.charge.as_deref() {
            Some(raw) => match parse_amount(raw) {
                Some(amount) => Some(amount),
                None => {
                    warnings.push(Warning::new(
                        Some("Charge"),
                        format!("unparsable amount '{}'; no invoice synthesized", raw),
                    ));
                    return None;
                }
            },
            None => None,
        };

        let (amount, note, from_default_price) = match charge {
            Some(amount) if amount > 0.0 => (amount, None, false),
            _ => match default_price {
                Some(price) if price > 0.0 => (price, Some(DEFAULT_PRICE_NOTE.to_string()), true),
                _ => return None,
            },
        };

        Some(Invoice {
            legacy_key: Invoice::legacy_key_for(&student.student_ref),
            student_ref: student.student_ref.clone(),
            student_id: None,
            amount,
            issued_on: self.date_field(legacy.charge_date.as_deref(), "Charge Date", warnings),
            note,
            from_default_price,
        })
    }

    fn payment(
        &mut self,
        student: &Student,
        purpose: PaymentPurpose,
        amount: Option<&str>,
        date: Option<&str>,
        (amount_field, date_field): (&str, &str),
        warnings: &mut Vec<Warning>,
    ) -> Option<Payment> {
        let raw = amount?;
        let amount = match parse_amount(raw) {
            Some(amount) if amount > 0.0 => amount,
            Some(_) => return None,
            None => {
                warnings.push(Warning::new(
                    Some(amount_field),
                    format!("unparsable amount '{}'; no {} payment synthesized", raw, purpose.as_str()),
                ));
                return None;
            }
        };

        let paid_on = self
            .date_field(date, date_field, warnings)
            .unwrap_or(self.run_date);

        Some(Payment {
            legacy_key: Payment::legacy_key_for(&student.student_ref, purpose),
            student_ref: student.student_ref.clone(),
            student_id: None,
            invoice_key: None,
            invoice_id: None,
            amount,
            paid_on,
            purpose,
            receipt_number: self.receipts.next(paid_on),
        })
    }

    fn date_field(&self, raw: Option<&str>, field: &str, warnings: &mut Vec<Warning>) -> Option<NaiveDate> {
        let raw = raw?;
        let parsed = parse_date(raw);
        if parsed.is_none() {
            warnings.push(Warning::new(Some(field), format!("'{}' is not a recognizable date", raw)));
        }
        parsed
    }
}

/// Per field: first non-empty value of the highest-priority source across
/// all members (every account holder, then every mother, then every father)
fn pick_contact(members: &[Student]) -> Contact {
    let candidates: Vec<&Contact> = (0..3)
        .flat_map(|rank| members.iter().map(move |m| m.legacy.contacts_by_priority()[rank]))
        .collect();

    let first = |get: fn(&Contact) -> &Option<String>| {
        candidates.iter().find_map(|c| get(c).clone())
    };

    Contact {
        name: first(|c| &c.name),
        phone: first(|c| &c.phone),
        email: first(|c| &c.email),
    }
}
