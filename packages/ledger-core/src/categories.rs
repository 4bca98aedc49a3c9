//! Canonical spend categories. Matching is case-insensitive exact; no
//! aliasing, per the Glossary's Canonical category definition.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Tuition,
    Housing,
    Books,
    FoodAndGroceries,
    RestaurantsAndFastFood,
    Transport,
    Utilities,
    DataAndAirtime,
    Hardware,
    Libraries,
    LabsAndClassrooms,
    HealthAndWellness,
    StudentCenterAndSocieties,
    SportsAndRecreation,
    ArtsAndCulture,
    CampusAccommodationServices,
    StationeryAndSupplies,
    Apparel,
    FinancialServices,
    Other,
    GeneralRetail,
}

impl Category {
    const ALL: &'static [(Category, &'static str)] = &[
        (Category::Tuition, "Tuition"),
        (Category::Housing, "Housing"),
        (Category::Books, "Books"),
        (Category::FoodAndGroceries, "Food & Groceries"),
        (Category::RestaurantsAndFastFood, "Restaurants & Fast Food"),
        (Category::Transport, "Transport"),
        (Category::Utilities, "Utilities"),
        (Category::DataAndAirtime, "Data & Airtime"),
        (Category::Hardware, "Hardware"),
        (Category::Libraries, "Libraries"),
        (Category::LabsAndClassrooms, "Labs & Classrooms"),
        (Category::HealthAndWellness, "Health & Wellness"),
        (Category::StudentCenterAndSocieties, "Student Center & Societies"),
        (Category::SportsAndRecreation, "Sports & Recreation"),
        (Category::ArtsAndCulture, "Arts & Culture"),
        (
            Category::CampusAccommodationServices,
            "Campus Accommodation Services",
        ),
        (Category::StationeryAndSupplies, "Stationery & Supplies"),
        (Category::Apparel, "Apparel"),
        (Category::FinancialServices, "Financial Services"),
        (Category::Other, "Other"),
        (Category::GeneralRetail, "General Retail"),
    ];

    /// Case-insensitive exact match against the canonical spelling. No
    /// aliasing: `"food"` or `"groceries"` alone do not match.
    pub fn parse(s: &str) -> Option<Category> {
        Self::ALL
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(cat, _)| *cat)
    }

    pub fn canonical(self) -> &'static str {
        Self::ALL.iter().find(|(cat, _)| *cat == self).unwrap().1
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_spelling_case_insensitively() {
        assert_eq!(Category::parse("food & groceries"), Some(Category::FoodAndGroceries));
        assert_eq!(Category::parse("FOOD & GROCERIES"), Some(Category::FoodAndGroceries));
    }

    #[test]
    fn rejects_aliases() {
        assert_eq!(Category::parse("groceries"), None);
        assert_eq!(Category::parse("food"), None);
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for (cat, name) in Category::ALL {
            assert_eq!(Category::parse(name), Some(*cat));
            assert_eq!(cat.to_string(), *name);
        }
    }
}
