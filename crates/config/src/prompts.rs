//! Prompt templates for the language model calls

use restaurant_agent_core::format_cents;

use crate::restaurant::RestaurantProfile;

/// Intent classification. The model must answer with exactly one label.
pub const INTENT_PROMPT: &str = "\
You classify what a restaurant caller wants. Answer with exactly one of these labels:
- new_order: the caller wants to place a new order or book a table
- modify_order: the caller wants to change an existing order or booking
- cancel_order: the caller wants to cancel an order or booking
- check_status: the caller asks about the status of an order
- general_inquiry: the caller asks a question (hours, menu, prices, delivery)
- end_call: the caller is saying goodbye or wants to hang up
- unclear: none of the above fits

Return only the label, nothing else.";

/// Structured extraction over the whole call transcript
pub const ORDER_PARSER_PROMPT: &str = "\
Extract the order or reservation from this restaurant phone call. Return a JSON object with:
- customer_name: the caller's name, or null if they never said it
- order_items: array of objects {\"item\": string, \"quantity\": integer, \"special_instructions\": string or null}
- is_delivery: true only if the caller asked for delivery
- address: delivery address, or null if not given
- reservation_time: ISO 8601 datetime if a table was booked, or null
- party_size: number of guests for a reservation, or null

Only include information the caller stated explicitly. Never guess or fill in defaults.";

/// Sentiment score over the whole call transcript
pub const SENTIMENT_PROMPT: &str = "\
Rate the overall sentiment of the caller in this restaurant phone call.
Return a single number between -1 and 1, where -1 is very negative, 0 is neutral and 1 is very positive.
Return only the number.";

/// System persona with the restaurant's fixed business facts and priced menu
pub fn conversation_persona(profile: &RestaurantProfile) -> String {
    let mut menu = String::new();
    for category in profile.categories() {
        let items = profile
            .menu
            .iter()
            .filter(|item| item.category == category)
            .map(|item| format!("{} {}", item.name, format_cents(item.price_cents)))
            .collect::<Vec<_>>()
            .join(", ");
        menu.push_str(&format!("- {}: {}\n", category, items));
    }

    format!(
        "You are the phone assistant for {name}. You take orders and reservations politely and efficiently.\n\
         \n\
         Restaurant details:\n\
         - Hours: {hours}\n\
         - Delivery within {radius} miles, {fee} delivery fee\n\
         - Reservations are needed for parties of {min_party} or more\n\
         \n\
         Menu:\n\
         {menu}\
         \n\
         When taking an order or reservation: get the caller's name, get the items or the time and party size, \
         confirm the details, then close politely.\n\
         Keep answers conversational and short, at most 3 sentences. \
         If you cannot help or cannot understand, offer to transfer the caller to a staff member.",
        name = profile.name,
        hours = profile.hours,
        radius = profile.delivery_radius_miles,
        fee = format_cents(profile.delivery_fee_cents),
        min_party = profile.min_reservation_size,
        menu = menu,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_carries_business_facts() {
        let persona = conversation_persona(&RestaurantProfile::default());
        assert!(persona.contains("Mario's Italian Restaurant"));
        assert!(persona.contains("closed Mondays"));
        assert!(persona.contains("Delivery within 5 miles, $3.00 delivery fee"));
        assert!(persona.contains("parties of 5 or more"));
        assert!(persona.contains("Margherita Pizza $16.00"));
        assert!(persona.contains("- desserts: Tiramisu $8.00"));
    }

    #[test]
    fn test_intent_prompt_lists_every_label() {
        for intent in restaurant_agent_core::Intent::ALL {
            assert!(INTENT_PROMPT.contains(intent.as_str()));
        }
    }
}
