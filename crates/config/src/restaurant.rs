//! Business facts and the menu price table

use restaurant_agent_core::MenuPricing;
use serde::{Deserialize, Serialize};

/// A priced menu entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub name: String,
    pub category: String,
    pub price_cents: u64,
}

impl MenuItem {
    fn new(name: &str, category: &str, price_cents: u64) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            price_cents,
        }
    }
}

/// Fixed facts about the restaurant, shared read-only by every call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestaurantProfile {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_hours")]
    pub hours: String,

    #[serde(default = "default_delivery_radius")]
    pub delivery_radius_miles: u32,

    #[serde(default = "default_delivery_fee")]
    pub delivery_fee_cents: u64,

    /// Parties at least this large need a reservation
    #[serde(default = "default_min_reservation_size")]
    pub min_reservation_size: u32,

    /// Unit price for anything not on the menu
    #[serde(default = "default_item_price")]
    pub default_item_price_cents: u64,

    #[serde(default = "default_menu")]
    pub menu: Vec<MenuItem>,
}

fn default_name() -> String {
    "Mario's Italian Restaurant".to_string()
}
fn default_hours() -> String {
    "Tuesday-Sunday, 11am-10pm (closed Mondays)".to_string()
}
fn default_delivery_radius() -> u32 {
    5
}
fn default_delivery_fee() -> u64 {
    300
}
fn default_min_reservation_size() -> u32 {
    5
}
fn default_item_price() -> u64 {
    1000
}

fn default_menu() -> Vec<MenuItem> {
    vec![
        MenuItem::new("Garlic Bread", "appetizers", 500),
        MenuItem::new("Bruschetta", "appetizers", 700),
        MenuItem::new("Calamari", "appetizers", 1200),
        MenuItem::new("Meatballs", "appetizers", 900),
        MenuItem::new("Caprese Salad", "appetizers", 1000),
        MenuItem::new("Margherita Pizza", "pizza", 1600),
        MenuItem::new("Pepperoni Pizza", "pizza", 1800),
        MenuItem::new("Vegetarian Pizza", "pizza", 1700),
        MenuItem::new("Supreme Pizza", "pizza", 2000),
        MenuItem::new("White Pizza", "pizza", 1900),
        MenuItem::new("Spaghetti Bolognese", "pasta", 1500),
        MenuItem::new("Fettuccine Alfredo", "pasta", 1400),
        MenuItem::new("Seafood Linguine", "pasta", 2200),
        MenuItem::new("Lasagna", "pasta", 1600),
        MenuItem::new("Penne Arrabbiata", "pasta", 1300),
        MenuItem::new("Tiramisu", "desserts", 800),
        MenuItem::new("Cannoli", "desserts", 700),
        MenuItem::new("Gelato", "desserts", 600),
        MenuItem::new("Panna Cotta", "desserts", 700),
        MenuItem::new("Chocolate Lava Cake", "desserts", 900),
        MenuItem::new("Soft Drinks", "beverages", 300),
        MenuItem::new("Italian Sodas", "beverages", 400),
        MenuItem::new("Coffee", "beverages", 300),
        MenuItem::new("Wine", "beverages", 700),
        MenuItem::new("Beer", "beverages", 500),
    ]
}

impl Default for RestaurantProfile {
    fn default() -> Self {
        Self {
            name: default_name(),
            hours: default_hours(),
            delivery_radius_miles: default_delivery_radius(),
            delivery_fee_cents: default_delivery_fee(),
            min_reservation_size: default_min_reservation_size(),
            default_item_price_cents: default_item_price(),
            menu: default_menu(),
        }
    }
}

impl RestaurantProfile {
    /// Case-insensitive exact lookup
    pub fn find_item(&self, name: &str) -> Option<&MenuItem> {
        let wanted = name.trim();
        self.menu
            .iter()
            .find(|item| item.name.eq_ignore_ascii_case(wanted))
    }

    /// Menu categories in first-seen order
    pub fn categories(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for item in &self.menu {
            if !seen.contains(&item.category.as_str()) {
                seen.push(item.category.as_str());
            }
        }
        seen
    }
}

impl MenuPricing for RestaurantProfile {
    fn unit_price_cents(&self, item_name: &str) -> u64 {
        self.find_item(item_name)
            .map(|item| item.price_cents)
            .unwrap_or(self.default_item_price_cents)
    }
}
