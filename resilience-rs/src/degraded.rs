//! Canned degraded responses, used as fallbacks when the LLM or a search
//! provider stays down after retries.

use chrono::{Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Error, Result};

const GENERIC_REPLY: &str = "I'm sorry, but I'm experiencing temporary issues with my advanced \
thinking capabilities. I can help with basic travel inquiries, but may not be able to process \
complex requests right now. Please try again later or ask a simpler question.";

const FLIGHT_REPLY: &str = "I'm having trouble accessing flight information right now. Please try \
again later or contact customer service for immediate assistance with your flight.";

const HOTEL_REPLY: &str = "I'm having trouble accessing hotel information right now. Please try \
again later or contact customer service for immediate assistance with your accommodation.";

const CANCEL_REPLY: &str = "If you're trying to cancel a booking, please contact customer service \
directly at support@travelagent.example.com or call 1-800-TRAVEL.";

const ESTIMATE_NOTE: &str = "Note: This is estimated data due to service disruption";
const PLACEHOLDER_NOTE: &str = "Note: This is placeholder data due to service disruption";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedReply {
    pub content: String,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightOption {
    pub airline: String,
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
    pub departure_date: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub price: String,
    pub currency: String,
    pub fallback: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotelOption {
    pub name: String,
    pub address: String,
    pub rating: String,
    pub price: String,
    pub currency: String,
    pub check_in: String,
    pub check_out: String,
    pub fallback: bool,
    pub message: String,
}

/// Reply chosen from keywords in the prompt
pub fn llm_reply(prompt: &str) -> DegradedReply {
    let lower = prompt.to_lowercase();
    let content = if lower.contains("flight") || lower.contains("fly") {
        FLIGHT_REPLY
    } else if ["hotel", "stay", "room"].iter().any(|k| lower.contains(k)) {
        HOTEL_REPLY
    } else if lower.contains("cancel") {
        CANCEL_REPLY
    } else {
        GENERIC_REPLY
    };

    warn!(prompt_len = prompt.len(), "Using degraded LLM reply");
    DegradedReply {
        content: content.to_string(),
        fallback: true,
    }
}

/// Two placeholder flights; `date` must be `YYYY-MM-DD`
pub fn flight_options(origin: &str, destination: &str, date: &str) -> Result<Vec<FlightOption>> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| Error::validation(format!("invalid departure date '{}': {}", date, e)))?;
    warn!(origin, destination, date, "Using degraded flight results");

    let morning = NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default();
    let flight = |airline: &str, prefix: &str, seed: String, offset_hours: i64| FlightOption {
        airline: airline.to_string(),
        flight_number: format!("{}{}", prefix, stable_hash(&seed) % 1000),
        origin: origin.to_string(),
        destination: destination.to_string(),
        departure_date: date.to_string(),
        departure_time: (morning + Duration::hours(offset_hours))
            .format("%H:%M")
            .to_string(),
        arrival_time: (morning + Duration::hours(offset_hours + 2))
            .format("%H:%M")
            .to_string(),
        price: "$---".to_string(),
        currency: "USD".to_string(),
        fallback: true,
        message: ESTIMATE_NOTE.to_string(),
    };

    Ok(vec![
        flight("Fallback Airways", "FB", format!("{}{}", origin, destination), 0),
        flight("Backup Airlines", "BU", format!("{}{}", destination, origin), 4),
    ])
}

/// Two placeholder hotels at `location`
pub fn hotel_options(location: &str, check_in: &str, check_out: &str) -> Vec<HotelOption> {
    warn!(location, check_in, check_out, "Using degraded hotel results");

    let hotel = |name: String, address: String| HotelOption {
        name,
        address,
        rating: "?".to_string(),
        price: "$---".to_string(),
        currency: "USD".to_string(),
        check_in: check_in.to_string(),
        check_out: check_out.to_string(),
        fallback: true,
        message: PLACEHOLDER_NOTE.to_string(),
    };

    vec![
        hotel(
            format!("Fallback Hotel {}", location),
            format!("123 Main St, {}", location),
        ),
        hotel(
            format!("Backup Resort {}", location),
            format!("456 Beach Rd, {}", location),
        ),
    ]
}

// FNV-1a; flight numbers stay the same across restarts
fn stable_hash(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_reply_keywords() {
        assert_eq!(llm_reply("Find me a flight to Bangkok").content, FLIGHT_REPLY);
        assert_eq!(llm_reply("Need a ROOM in Paris").content, HOTEL_REPLY);
        assert_eq!(llm_reply("please cancel my booking").content, CANCEL_REPLY);
        assert_eq!(llm_reply("hello").content, GENERIC_REPLY);
        assert!(llm_reply("hello").fallback);
    }

    #[test]
    fn test_flight_options() {
        let flights = flight_options("DMM", "BKK", "2026-03-01").unwrap();
        assert_eq!(flights.len(), 2);
        assert_eq!(flights[0].departure_time, "10:00");
        assert_eq!(flights[0].arrival_time, "12:00");
        assert_eq!(flights[1].departure_time, "14:00");
        assert_eq!(flights[1].arrival_time, "16:00");
        assert!(flights[0].flight_number.starts_with("FB"));
        assert!(flights.iter().all(|f| f.fallback));

        let again = flight_options("DMM", "BKK", "2026-03-01").unwrap();
        assert_eq!(flights, again);
    }

    #[test]
    fn test_flight_options_rejects_bad_date() {
        let err = flight_options("DMM", "BKK", "next tuesday").unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Validation);
    }

    #[test]
    fn test_hotel_options() {
        let hotels = hotel_options("Lisbon", "2026-03-01", "2026-03-04");
        assert_eq!(hotels[0].name, "Fallback Hotel Lisbon");
        assert_eq!(hotels[1].address, "456 Beach Rd, Lisbon");
        assert_eq!(hotels[1].check_out, "2026-03-04");
    }
}
