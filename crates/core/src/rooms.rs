//! Raum-Topologie – deterministische Adressen fuer Broadcast-Raeume
//!
//! Raeume werden nicht gespeichert, sondern aus Tenant-, User- und
//! Entitaets-IDs berechnet. Jede Adresse beginnt mit `tenant:{id}`, damit
//! der eingebettete Tenant vor jedem Beitritt und jeder Aussendung gegen
//! den Tenant der Verbindung geprueft werden kann.
//!
//! ```text
//! tenant:{t}                        Tenant-Raum
//! tenant:{t}:user:{u}               User-Raum
//! tenant:{t}:entity:{typ}:{id}      Entitaets-Raum
//! tenant:{t}:entity:{typ}           Entitaetstyp-Raum
//! tenant:{t}:admin                  Admin-Raum
//! tenant:{t}:notifications          Benachrichtigungs-Raum
//! ```

use crate::types::{EntitaetsTyp, EntityId, TenantId, UserId};

const TENANT_PRAEFIX: &str = "tenant";
const USER_SEGMENT: &str = "user";
const ENTITY_SEGMENT: &str = "entity";
const ADMIN_SEGMENT: &str = "admin";
const NOTIFICATION_SEGMENT: &str = "notifications";

/// Geparste Raum-Adresse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaumAdresse {
    Tenant(TenantId),
    Benutzer(TenantId, UserId),
    Entitaet(TenantId, EntitaetsTyp, EntityId),
    EntitaetsTyp(TenantId, EntitaetsTyp),
    Admin(TenantId),
    Benachrichtigungen(TenantId),
}

impl RaumAdresse {
    /// Der in der Adresse eingebettete Tenant
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::Tenant(t)
            | Self::Benutzer(t, _)
            | Self::Entitaet(t, _, _)
            | Self::EntitaetsTyp(t, _)
            | Self::Admin(t)
            | Self::Benachrichtigungen(t) => t,
        }
    }

    /// Baut die String-Adresse
    pub fn adresse(&self) -> String {
        match self {
            Self::Tenant(t) => tenant_raum(t),
            Self::Benutzer(t, u) => benutzer_raum(t, u),
            Self::Entitaet(t, typ, id) => entitaets_raum(t, *typ, id),
            Self::EntitaetsTyp(t, typ) => entitaetstyp_raum(t, *typ),
            Self::Admin(t) => admin_raum(t),
            Self::Benachrichtigungen(t) => benachrichtigungs_raum(t),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub fn tenant_raum(tenant: &TenantId) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}")
}

pub fn benutzer_raum(tenant: &TenantId, user: &UserId) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}:{USER_SEGMENT}:{user}")
}

pub fn entitaets_raum(tenant: &TenantId, typ: EntitaetsTyp, id: &EntityId) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}:{ENTITY_SEGMENT}:{typ}:{id}")
}

pub fn entitaetstyp_raum(tenant: &TenantId, typ: EntitaetsTyp) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}:{ENTITY_SEGMENT}:{typ}")
}

pub fn admin_raum(tenant: &TenantId) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}:{ADMIN_SEGMENT}")
}

pub fn benachrichtigungs_raum(tenant: &TenantId) -> String {
    format!("{TENANT_PRAEFIX}:{tenant}:{NOTIFICATION_SEGMENT}")
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parst eine Raum-Adresse
///
/// Gibt `None` fuer jede Adresse zurueck, die kein Builder erzeugt haben
/// koennte (unbekannte Segmente, ungueltige IDs, Entitaetstyp nicht auf
/// der Allow-List).
pub fn raum_parsen(adresse: &str) -> Option<RaumAdresse> {
    let teile: Vec<&str> = adresse.split(':').collect();
    if teile.first() != Some(&TENANT_PRAEFIX) || teile.len() < 2 {
        return None;
    }
    let tenant = TenantId::neu(teile[1]).ok()?;

    match &teile[2..] {
        [] => Some(RaumAdresse::Tenant(tenant)),
        [USER_SEGMENT, user] => Some(RaumAdresse::Benutzer(tenant, UserId::neu(*user).ok()?)),
        [ENTITY_SEGMENT, typ] => Some(RaumAdresse::EntitaetsTyp(tenant, typ.parse().ok()?)),
        [ENTITY_SEGMENT, typ, id] => Some(RaumAdresse::Entitaet(
            tenant,
            typ.parse().ok()?,
            EntityId::neu(*id).ok()?,
        )),
        [ADMIN_SEGMENT] => Some(RaumAdresse::Admin(tenant)),
        [NOTIFICATION_SEGMENT] => Some(RaumAdresse::Benachrichtigungen(tenant)),
        _ => None,
    }
}

pub fn tenant_id_extrahieren(adresse: &str) -> Option<TenantId> {
    raum_parsen(adresse).map(|r| r.tenant_id().clone())
}

pub fn user_id_extrahieren(adresse: &str) -> Option<UserId> {
    match raum_parsen(adresse)? {
        RaumAdresse::Benutzer(_, u) => Some(u),
        _ => None,
    }
}

pub fn entitaets_typ_extrahieren(adresse: &str) -> Option<EntitaetsTyp> {
    match raum_parsen(adresse)? {
        RaumAdresse::Entitaet(_, typ, _) | RaumAdresse::EntitaetsTyp(_, typ) => Some(typ),
        _ => None,
    }
}

pub fn entitaets_id_extrahieren(adresse: &str) -> Option<EntityId> {
    match raum_parsen(adresse)? {
        RaumAdresse::Entitaet(_, _, id) => Some(id),
        _ => None,
    }
}

/// Prueft ob ein Raum zum angegebenen Tenant gehoert
///
/// Einziger Mechanismus gegen Cross-Tenant-Leaks: wird bei jedem Beitritt
/// und vor jeder Aussendung aufgerufen. Nicht parsebare Adressen werden
/// immer abgelehnt.
pub fn tenant_zugriff_pruefen(adresse: &str, tenant: &TenantId) -> bool {
    tenant_id_extrahieren(adresse).is_some_and(|t| &t == tenant)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: &str) -> TenantId {
        TenantId::neu(id).unwrap()
    }

    fn u(id: &str) -> UserId {
        UserId::neu(id).unwrap()
    }

    fn e(id: &str) -> EntityId {
        EntityId::neu(id).unwrap()
    }

    #[test]
    fn adressformat() {
        assert_eq!(tenant_raum(&t("acme")), "tenant:acme");
        assert_eq!(benutzer_raum(&t("acme"), &u("u1")), "tenant:acme:user:u1");
        assert_eq!(
            entitaets_raum(&t("acme"), EntitaetsTyp::Account, &e("a1")),
            "tenant:acme:entity:account:a1"
        );
        assert_eq!(
            entitaetstyp_raum(&t("acme"), EntitaetsTyp::Card),
            "tenant:acme:entity:card"
        );
        assert_eq!(admin_raum(&t("acme")), "tenant:acme:admin");
        assert_eq!(benachrichtigungs_raum(&t("acme")), "tenant:acme:notifications");
    }

    #[test]
    fn user_raum_round_trip() {
        for (tenant, user) in [("acme", "u1"), ("t-2", "max.mustermann@example.org"), ("x", "y_z")] {
            let raum = benutzer_raum(&t(tenant), &u(user));
            assert_eq!(tenant_id_extrahieren(&raum), Some(t(tenant)));
            assert_eq!(user_id_extrahieren(&raum), Some(u(user)));
        }
    }

    #[test]
    fn alle_builder_sind_exakt_invertierbar() {
        let tenant = t("acme");
        let adressen = [
            RaumAdresse::Tenant(tenant.clone()),
            RaumAdresse::Benutzer(tenant.clone(), u("u1")),
            RaumAdresse::Entitaet(tenant.clone(), EntitaetsTyp::Transaction, e("tx-9")),
            RaumAdresse::EntitaetsTyp(tenant.clone(), EntitaetsTyp::Category),
            RaumAdresse::Admin(tenant.clone()),
            RaumAdresse::Benachrichtigungen(tenant),
        ];
        for adresse in adressen {
            assert_eq!(raum_parsen(&adresse.adresse()), Some(adresse));
        }
    }

    #[test]
    fn entitaets_felder_extrahieren() {
        let raum = entitaets_raum(&t("acme"), EntitaetsTyp::Card, &e("c7"));
        assert_eq!(entitaets_typ_extrahieren(&raum), Some(EntitaetsTyp::Card));
        assert_eq!(entitaets_id_extrahieren(&raum), Some(e("c7")));
        assert_eq!(user_id_extrahieren(&raum), None);

        let typ_raum = entitaetstyp_raum(&t("acme"), EntitaetsTyp::Card);
        assert_eq!(entitaets_typ_extrahieren(&typ_raum), Some(EntitaetsTyp::Card));
        assert_eq!(entitaets_id_extrahieren(&typ_raum), None);
    }

    #[test]
    fn tenant_zugriff_nur_fuer_eigenen_tenant() {
        let raum = entitaets_raum(&t("t1"), EntitaetsTyp::Account, &e("a1"));
        assert!(tenant_zugriff_pruefen(&raum, &t("t1")));
        assert!(!tenant_zugriff_pruefen(&raum, &t("t2")));
        assert!(!tenant_zugriff_pruefen(&raum, &t("t")));
    }

    #[test]
    fn ungueltige_adressen_werden_abgelehnt() {
        for adresse in [
            "",
            "tenant",
            "tenant:",
            "room:acme",
            "tenant:acme:user",
            "tenant:acme:entity:budget:b1",
            "tenant:acme:entity:account:a1:extra",
            "tenant:acme:unbekannt",
        ] {
            assert_eq!(raum_parsen(adresse), None, "Adresse {adresse:?}");
            assert!(!tenant_zugriff_pruefen(adresse, &t("acme")));
        }
    }
}
