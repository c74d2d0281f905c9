// 💵 Billing Artifacts - invoices and payments synthesized per student

use super::EntityKind;
use crate::db::EntityRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentPurpose {
    /// Deposit against the tuition invoice
    Deposit,
    /// First ancillary slot (uniform)
    Uniform,
    /// Second ancillary slot (uniform)
    UniformSecond,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::Deposit => "deposit",
            PaymentPurpose::Uniform => "uniform",
            PaymentPurpose::UniformSecond => "uniform_2",
        }
    }

    /// Suffix of the payment's legacy key
    pub fn key_suffix(&self) -> &'static str {
        match self {
            PaymentPurpose::Deposit => "DEPOSIT",
            PaymentPurpose::Uniform => "UNIFORM1",
            PaymentPurpose::UniformSecond => "UNIFORM2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub legacy_key: String,
    pub student_ref: String,
    pub student_id: Option<i64>,
    pub amount: f64,
    pub issued_on: Option<NaiveDate>,
    pub note: Option<String>,
    /// Amount came from the school's default price
    pub from_default_price: bool,
}

impl Invoice {
    pub fn legacy_key_for(student_ref: &str) -> String {
        format!("INV-{}", student_ref)
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::Invoice, &self.legacy_key)
            .column("student_id", json!(self.student_id))
            .column("amount", json!(self.amount))
            .column("issued_on", json!(self.issued_on.map(|d| d.to_string())))
            .column("note", json!(self.note))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub legacy_key: String,
    pub student_ref: String,
    pub student_id: Option<i64>,
    /// Legacy key of the invoice this payment settles
    pub invoice_key: Option<String>,
    pub invoice_id: Option<i64>,
    pub amount: f64,
    pub paid_on: NaiveDate,
    pub purpose: PaymentPurpose,
    pub receipt_number: String,
}

impl Payment {
    pub fn legacy_key_for(student_ref: &str, purpose: PaymentPurpose) -> String {
        format!("PAY-{}-{}", student_ref, purpose.key_suffix())
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::Payment, &self.legacy_key)
            .column("student_id", json!(self.student_id))
            .column("invoice_id", json!(self.invoice_id))
            .column("amount", json!(self.amount))
            .column("paid_on", json!(self.paid_on.to_string()))
            .column("purpose", json!(self.purpose.as_str()))
            .column("receipt_number", json!(self.receipt_number))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingArtifact {
    pub invoice: Option<Invoice>,
    pub payment: Option<Payment>,
    pub ancillary_payments: Vec<Payment>,
}

impl BillingArtifact {
    pub fn is_empty(&self) -> bool {
        self.invoice.is_none() && self.payment.is_none() && self.ancillary_payments.is_empty()
    }

    /// All payments, main one first
    pub fn payments(&self) -> impl Iterator<Item = &Payment> {
        self.payment.iter().chain(self.ancillary_payments.iter())
    }

    pub fn payments_mut(&mut self) -> impl Iterator<Item = &mut Payment> {
        self.payment.iter_mut().chain(self.ancillary_payments.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_keys() {
        assert_eq!(Invoice::legacy_key_for("1001"), "INV-1001");
        assert_eq!(
            Payment::legacy_key_for("1001", PaymentPurpose::UniformSecond),
            "PAY-1001-UNIFORM2"
        );
    }

    #[test]
    fn test_payments_iterates_main_first() {
        let paid_on = NaiveDate::from_ymd_opt(2024, 9, 3).unwrap();
        let payment = |purpose: PaymentPurpose| Payment {
            legacy_key: Payment::legacy_key_for("1", purpose),
            student_ref: "1".to_string(),
            student_id: None,
            invoice_key: None,
            invoice_id: None,
            amount: 10.0,
            paid_on,
            purpose,
            receipt_number: "20240903-0001".to_string(),
        };

        let artifact = BillingArtifact {
            invoice: None,
            payment: Some(payment(PaymentPurpose::Deposit)),
            ancillary_payments: vec![payment(PaymentPurpose::Uniform)],
        };

        let purposes: Vec<_> = artifact.payments().map(|p| p.purpose).collect();
        assert_eq!(purposes, vec![PaymentPurpose::Deposit, PaymentPurpose::Uniform]);
        assert!(!artifact.is_empty());
    }
}
