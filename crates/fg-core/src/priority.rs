use regex::Regex;
use tracing::debug;

use fg_types::{FlowgateError, PageContext, Priority, Result};

const COMPLAINT_TERMS: &[&str] = &[
    "complaint",
    "complain",
    "refund",
    "scam",
    "fraud",
    "lawyer",
    "unacceptable",
    "terrible",
    "worst",
    "angry",
    "furious",
    "escalate",
    "manager",
    "supervisor",
    "speak to a human",
    "talk to a human",
    "real person",
    "cancel my order",
];

const PAYMENT_TERMS: &[&str] = &[
    "pay",
    "payment",
    "paid",
    "invoice",
    "checkout",
    "billing",
    "charged",
    "credit card",
    "card declined",
    "bank transfer",
    "transfer",
    "receipt",
    "deposit",
];

const INQUIRY_TERMS: &[&str] = &[
    "price",
    "cost",
    "how much",
    "available",
    "availability",
    "in stock",
    "stock",
    "size",
    "color",
    "product",
    "catalog",
    "book",
    "booking",
    "appointment",
    "reservation",
    "reserve",
    "schedule",
    "order",
    "delivery",
    "shipping",
];

/// Assigns an urgency to inbound messages. Highest matching rule wins.
pub struct PriorityClassifier {
    complaint: Regex,
    payment: Regex,
    inquiry: Regex,
}

impl PriorityClassifier {
    /// Build a classifier from custom term lists (matched case-insensitively
    /// on word boundaries).
    pub fn with_terms(complaint: &[&str], payment: &[&str], inquiry: &[&str]) -> Result<Self> {
        Ok(Self {
            complaint: term_regex(complaint)?,
            payment: term_regex(payment)?,
            inquiry: term_regex(inquiry)?,
        })
    }

    /// `first_contact` is true when the sender has not been seen before.
    pub fn classify(&self, text: &str, context: Option<&PageContext>, first_contact: bool) -> Priority {
        let handoff = context.is_some_and(|c| c.human_handoff_active);
        let cart = context.is_some_and(|c| c.cart_items > 0);

        let (priority, reason) = if handoff {
            (Priority::Critical, "human handoff")
        } else if self.complaint.is_match(text) {
            (Priority::Critical, "complaint")
        } else if self.payment.is_match(text) {
            (Priority::High, "payment")
        } else if first_contact {
            (Priority::High, "first contact")
        } else if cart {
            (Priority::High, "cart")
        } else if self.inquiry.is_match(text) {
            (Priority::Medium, "inquiry")
        } else {
            (Priority::Low, "default")
        };

        debug!(priority = %priority, reason, "Message classified");
        priority
    }
}

impl Default for PriorityClassifier {
    fn default() -> Self {
        Self::with_terms(COMPLAINT_TERMS, PAYMENT_TERMS, INQUIRY_TERMS)
            .expect("built-in priority terms are valid patterns")
    }
}

fn term_regex(terms: &[&str]) -> Result<Regex> {
    if terms.is_empty() {
        // Matches nothing.
        return Regex::new(r"\b\B")
            .map_err(|e| FlowgateError::Config(format!("Invalid priority pattern: {e}")));
    }
    let alternation = terms
        .iter()
        .map(|t| regex::escape(t.trim()))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
        .map_err(|e| FlowgateError::Config(format!("Invalid priority pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Priority {
        PriorityClassifier::default().classify(text, None, false)
    }

    #[test]
    fn complaint_language_is_critical() {
        assert_eq!(classify("I want a REFUND now"), Priority::Critical);
        assert_eq!(classify("let me speak to a human please"), Priority::Critical);
    }

    #[test]
    fn handoff_beats_everything() {
        let ctx = PageContext {
            human_handoff_active: true,
            ..Default::default()
        };
        let p = PriorityClassifier::default().classify("hello", Some(&ctx), false);
        assert_eq!(p, Priority::Critical);
    }

    #[test]
    fn payment_first_contact_and_cart_are_high() {
        let c = PriorityClassifier::default();
        assert_eq!(c.classify("Did my payment go through?", None, false), Priority::High);
        assert_eq!(c.classify("hi there", None, true), Priority::High);

        let ctx = PageContext {
            cart_items: 2,
            ..Default::default()
        };
        assert_eq!(c.classify("hi there", Some(&ctx), false), Priority::High);
    }

    #[test]
    fn inquiry_is_medium_and_rest_low() {
        assert_eq!(classify("is this available in blue?"), Priority::Medium);
        assert_eq!(classify("I'd like to book an appointment"), Priority::Medium);
        assert_eq!(classify("thanks, have a nice day"), Priority::Low);
    }

    #[test]
    fn highest_match_wins() {
        assert_eq!(classify("cancel my order, this is a scam"), Priority::Critical);
        assert_eq!(classify("what is the price to pay by card"), Priority::High);
    }

    #[test]
    fn terms_match_whole_words_only() {
        // "payday" and "bookshelf" contain terms but are different words.
        assert_eq!(classify("payday is friday"), Priority::Low);
        assert_eq!(classify("nice bookshelf"), Priority::Low);
    }

    #[test]
    fn custom_terms() {
        let c = PriorityClassifier::with_terms(&["urgent"], &[], &["menu"]).unwrap();
        assert_eq!(c.classify("URGENT help", None, false), Priority::Critical);
        assert_eq!(c.classify("pay now", None, false), Priority::Low);
        assert_eq!(c.classify("menu?", None, false), Priority::Medium);
    }
}
