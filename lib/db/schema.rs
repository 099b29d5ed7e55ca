// Target and source databases share this layout.

diesel::table! {
    user (id) {
        id -> BigInt,
        uid -> Varchar,
        pic_md5 -> Nullable<Blob>,
        province_code -> Varchar,
        city_code -> Varchar,
        town_code -> Varchar,
    }
}

diesel::table! {
    feature_model_0330 (id) {
        id -> BigInt,
        user_id -> BigInt,
        timestamp -> BigInt,
        feature_id -> Nullable<Varchar>,
        feature -> Nullable<Blob>,
        province_code -> Varchar,
        city_code -> Varchar,
        town_code -> Varchar,
    }
}

diesel::allow_tables_to_appear_in_same_query!(feature_model_0330, user,);
